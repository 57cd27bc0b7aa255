//! Buffer type descriptors
//!
//! A buffer holds entries of exactly one shape. The set of shapes is closed:
//!
//! - `SmallArray { array_size }`: runs of `array_size` inline elements
//! - `LargeArray`: one [`LargeArrayEntry`] per array, pointing at a heap slice
//!
//! Sizes inside the data store are counted in elements. For small arrays an
//! element is one value; for large arrays an element is one heap header, so
//! every large array occupies exactly one element.

use attrstore_core::BufferGrowth;
use std::alloc::{dealloc, Layout};
use std::mem;
use std::ptr;

/// Shape of the entries in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Fixed-length inline arrays
    SmallArray {
        /// Elements per array
        array_size: usize,
    },
    /// Heap-backed arrays of any length
    LargeArray {
        /// Size of one array value
        value_size: usize,
        /// Alignment of one array value
        value_align: usize,
    },
}

/// Type descriptor registered with a data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferType {
    kind: BufferKind,
    elem_size: usize,
    elem_align: usize,
    growth: BufferGrowth,
}

impl BufferType {
    /// Descriptor for inline arrays of `array_size` values of `T`
    ///
    /// # Panics
    ///
    /// Panics if `array_size` is zero.
    pub fn small_array<T>(array_size: usize, growth: BufferGrowth) -> Self {
        assert!(array_size > 0, "small arrays must have at least one element");
        BufferType {
            kind: BufferKind::SmallArray { array_size },
            elem_size: mem::size_of::<T>(),
            elem_align: mem::align_of::<T>(),
            growth,
        }
    }

    /// Descriptor for heap-backed arrays of `T`
    pub fn large_array<T>(growth: BufferGrowth) -> Self {
        BufferType {
            kind: BufferKind::LargeArray {
                value_size: mem::size_of::<T>(),
                value_align: mem::align_of::<T>(),
            },
            elem_size: mem::size_of::<LargeArrayEntry>(),
            elem_align: mem::align_of::<LargeArrayEntry>(),
            growth,
        }
    }

    /// Entry shape
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Check if entries are heap-backed arrays
    pub fn is_large_array(&self) -> bool {
        matches!(self.kind, BufferKind::LargeArray { .. })
    }

    /// Elements per array
    pub fn array_size(&self) -> usize {
        match self.kind {
            BufferKind::SmallArray { array_size } => array_size,
            BufferKind::LargeArray { .. } => 1,
        }
    }

    /// Bytes per element
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Alignment of the buffer allocation
    pub fn elem_align(&self) -> usize {
        self.elem_align
    }

    /// Growth policy for new buffers of this type
    pub fn growth(&self) -> BufferGrowth {
        self.growth
    }

    /// Elements to allocate for a new buffer
    ///
    /// Returns `None` when even a maximal buffer cannot fit `needed_elems`.
    ///
    /// # Arguments
    ///
    /// * `used_elems` - elements in use by in-service buffers of this type
    /// * `needed_elems` - elements the new buffer must fit
    /// * `offset_size` - arrays addressable per buffer
    pub fn elems_to_alloc(
        &self,
        used_elems: usize,
        needed_elems: usize,
        offset_size: usize,
    ) -> Option<usize> {
        let array_size = self.array_size();
        let used_arrays = used_elems / array_size;
        let needed_arrays = (needed_elems + array_size - 1) / array_size;
        let arrays = self
            .growth
            .arrays_to_alloc(used_arrays, needed_arrays, offset_size);
        if arrays < needed_arrays {
            return None;
        }
        Some(arrays * array_size)
    }

    /// Byte layout of a buffer holding `elems` elements
    pub(crate) fn buffer_layout(&self, elems: usize) -> Option<Layout> {
        let bytes = self.elem_size.checked_mul(elems)?;
        // Never ask the allocator for zero bytes
        Layout::from_size_align(bytes.max(self.elem_align), self.elem_align).ok()
    }

    /// Release the heap memory behind `elems` large array entries
    ///
    /// Small array elements are plain values and need no cleaning.
    ///
    /// # Safety
    ///
    /// `data` must point at `elems` initialized elements of this type, and no
    /// reader may still access them.
    pub(crate) unsafe fn clean(&self, data: *mut u8, elems: usize) {
        if let BufferKind::LargeArray {
            value_size,
            value_align,
        } = self.kind
        {
            let entries = data as *mut LargeArrayEntry;
            for i in 0..elems {
                let entry = &mut *entries.add(i);
                entry.release(value_size, value_align);
            }
        }
    }

    /// Heap bytes owned by the large array entry at `data`
    ///
    /// # Safety
    ///
    /// `data` must point at an initialized element of this type.
    pub(crate) unsafe fn extra_bytes(&self, data: *const u8) -> usize {
        match self.kind {
            BufferKind::SmallArray { .. } => 0,
            BufferKind::LargeArray { value_size, .. } => {
                (*(data as *const LargeArrayEntry)).len * value_size
            }
        }
    }
}

/// Header of a heap-backed array
///
/// The buffer owns the heap slice. A null pointer marks an empty slot
/// (never written, or already released).
#[repr(C)]
#[derive(Debug)]
pub struct LargeArrayEntry {
    ptr: *mut u8,
    len: usize,
}

impl LargeArrayEntry {
    /// Move `values` to the heap and return the owning header
    pub fn new<T: Copy>(values: &[T]) -> Self {
        let boxed: Box<[T]> = values.into();
        let len = boxed.len();
        LargeArrayEntry {
            ptr: Box::into_raw(boxed) as *mut T as *mut u8,
            len,
        }
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the header owns no values
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }

    /// View the values
    ///
    /// # Safety
    ///
    /// `T` must be the type the entry was created with, and the entry must
    /// not have been released.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.ptr.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr as *const T, self.len)
    }

    /// Free the heap slice and reset the header
    unsafe fn release(&mut self, value_size: usize, value_align: usize) {
        if self.ptr.is_null() {
            return;
        }
        let bytes = self.len * value_size;
        if bytes != 0 {
            let layout = Layout::from_size_align_unchecked(bytes, value_align);
            dealloc(self.ptr, layout);
        }
        self.ptr = ptr::null_mut();
        self.len = 0;
    }
}
