//! Addressing types for the arena data store
//!
//! This module defines the handles every other component uses to name a
//! stored value:
//! - [`EntryRef`]: Opaque 32-bit reference to one stored entry
//! - [`RefLayout`]: Bit split of a reference into `(offset, buffer_id)`
//! - [`Generation`]: Writer epoch counter used to delay reclamation
//!
//! A reference is only meaningful to the store that produced it. The layout
//! is a per-store setting; two stores with different layouts decode the same
//! raw value differently.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Writer epoch counter
///
/// The writer bumps the generation after publishing a batch of changes.
/// Memory retired at generation `g` may be reused once no reader holds a
/// guard on a generation `<= g`.
pub type Generation = u64;

/// Compact reference to an entry stored in a data store
///
/// The raw value packs an offset (low bits) and a buffer id (high bits)
/// according to the owning store's [`RefLayout`]. The all-zero value is the
/// reserved invalid reference and means "no value".
///
/// # Examples
///
/// ```
/// use attrstore_core::types::EntryRef;
///
/// let r = EntryRef::default();
/// assert!(!r.is_valid());
/// assert_eq!(r, EntryRef::INVALID);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EntryRef(u32);

impl EntryRef {
    /// The reserved "no value" reference
    pub const INVALID: EntryRef = EntryRef(0);

    /// Rebuild a reference from its raw encoding
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        EntryRef(raw)
    }

    /// Raw encoding, suitable for storing in an atomic slot
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this reference names a stored entry
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryRef({:#x})", self.0)
    }
}

/// Bit split of an [`EntryRef`]
///
/// - `offset_bits`: low bits holding the intra-buffer offset
/// - `buffer_bits`: high bits holding the buffer id
/// - `align_bits`: offsets are stored right-shifted by this many bits, so
///   the addressable offset range grows by `2^align_bits` at the cost of
///   rounding every offset up to that granularity
///
/// `offset_bits + buffer_bits` must not exceed 32.
///
/// # Examples
///
/// ```
/// use attrstore_core::types::RefLayout;
///
/// let layout = RefLayout::new(22, 10).unwrap();
/// let r = layout.make(237, 13);
/// assert_eq!(layout.offset(r), 237);
/// assert_eq!(layout.buffer_id(r), 13);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefLayout {
    /// Number of low bits used for the offset
    pub offset_bits: u32,
    /// Number of bits used for the buffer id
    pub buffer_bits: u32,
    /// Offset granularity as a power of two
    #[serde(default)]
    pub align_bits: u32,
}

/// Largest supported offset granularity (64 KiB)
const MAX_ALIGN_BITS: u32 = 16;

impl RefLayout {
    /// 19 offset bits (524288 arrays per buffer), 13 buffer bits (8192 buffers)
    pub const DEFAULT: RefLayout = RefLayout {
        offset_bits: 19,
        buffer_bits: 13,
        align_bits: 0,
    };

    /// Create an unaligned layout
    pub fn new(offset_bits: u32, buffer_bits: u32) -> Result<Self> {
        Self::aligned(offset_bits, buffer_bits, 0)
    }

    /// Create a layout whose offsets are multiples of `2^align_bits`
    pub fn aligned(offset_bits: u32, buffer_bits: u32, align_bits: u32) -> Result<Self> {
        let layout = RefLayout {
            offset_bits,
            buffer_bits,
            align_bits,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check the bit split
    pub fn validate(&self) -> Result<()> {
        let fits = self.offset_bits > 0
            && self.buffer_bits > 0
            && self.offset_bits + self.buffer_bits <= 32
            && self.align_bits <= MAX_ALIGN_BITS;
        if fits {
            Ok(())
        } else {
            Err(Error::InvalidRefLayout {
                offset_bits: self.offset_bits,
                buffer_bits: self.buffer_bits,
                align_bits: self.align_bits,
            })
        }
    }

    /// Number of distinct offsets a reference can address
    #[inline]
    pub fn offset_size(&self) -> usize {
        1usize << (self.offset_bits + self.align_bits)
    }

    /// Number of buffer ids a reference can address
    #[inline]
    pub fn num_buffers(&self) -> u32 {
        1u32 << self.buffer_bits
    }

    /// Round `value` up to the offset granularity
    #[inline]
    pub fn align(&self, value: usize) -> usize {
        let mask = (1usize << self.align_bits) - 1;
        (value + mask) & !mask
    }

    /// Padding needed to bring `value` to the offset granularity
    #[inline]
    pub fn pad(&self, value: usize) -> usize {
        self.align(value) - value
    }

    /// Encode `(offset, buffer_id)`
    ///
    /// The offset is rounded up to the layout granularity.
    #[inline]
    pub fn make(&self, offset: usize, buffer_id: u32) -> EntryRef {
        debug_assert!(
            offset < self.offset_size(),
            "offset {} out of range for {} offset bits",
            offset,
            self.offset_bits
        );
        debug_assert!(
            buffer_id < self.num_buffers(),
            "buffer id {} out of range for {} buffer bits",
            buffer_id,
            self.buffer_bits
        );
        let stored = (self.align(offset) >> self.align_bits) as u32;
        EntryRef(stored | (buffer_id << self.offset_bits))
    }

    /// Extract the offset
    #[inline]
    pub fn offset(&self, r: EntryRef) -> usize {
        let mask = (1u32 << self.offset_bits) - 1;
        ((r.0 & mask) as usize) << self.align_bits
    }

    /// Extract the buffer id
    #[inline]
    pub fn buffer_id(&self, r: EntryRef) -> u32 {
        let mask = (1u32 << self.buffer_bits) - 1;
        (r.0 >> self.offset_bits) & mask
    }
}

impl Default for RefLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
