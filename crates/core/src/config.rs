//! Configuration consumed by the data store layers
//!
//! All options are plain structs with public fields, a `Default` that
//! matches production settings, and `validate()` for checking values that
//! arrive from outside (for example deserialized JSON).

use crate::error::{Error, Result};
use crate::memory_usage::{AddressSpace, MemoryUsage};
use crate::types::RefLayout;
use serde::{Deserialize, Serialize};

/// Minimum number of arrays in a freshly allocated buffer
pub const MIN_BUFFER_ARRAYS: usize = 1024;

/// Minimum dead bytes before memory compaction is considered
pub const DEAD_BYTES_SLACK: usize = 0x10000;

/// Minimum dead arrays before address space compaction is considered
pub const DEAD_CLUSTERS_SLACK: usize = 0x10000;

// ============================================================================
// Buffer growth
// ============================================================================

/// Sizing policy for new buffers of one type
///
/// A new buffer is sized to hold `grow_percent` percent of the arrays
/// already used by in-service buffers of the same type, clamped to
/// `[min_arrays, max_arrays]` and never smaller than the request that
/// triggered it. The default of 100 percent doubles the total capacity of a
/// type on every switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferGrowth {
    /// Floor for a new buffer, in arrays
    pub min_arrays: usize,
    /// Ceiling for a new buffer, in arrays (further capped by the ref layout)
    pub max_arrays: usize,
    /// Growth relative to arrays already in use
    pub grow_percent: u32,
}

impl BufferGrowth {
    /// Check the bounds
    pub fn validate(&self) -> Result<()> {
        if self.min_arrays == 0 {
            return Err(Error::InvalidBufferGrowth(
                "min_arrays must be at least 1".to_string(),
            ));
        }
        if self.min_arrays > self.max_arrays {
            return Err(Error::InvalidBufferGrowth(format!(
                "min_arrays {} exceeds max_arrays {}",
                self.min_arrays, self.max_arrays
            )));
        }
        Ok(())
    }

    /// Number of arrays for a new buffer
    ///
    /// # Arguments
    ///
    /// * `used_arrays` - arrays already used by in-service buffers of the type
    /// * `needed_arrays` - arrays the new buffer must fit
    /// * `addressable_arrays` - hard limit imposed by the ref layout
    pub fn arrays_to_alloc(
        &self,
        used_arrays: usize,
        needed_arrays: usize,
        addressable_arrays: usize,
    ) -> usize {
        let grown = used_arrays.saturating_mul(self.grow_percent as usize) / 100;
        let max_arrays = self.max_arrays.min(addressable_arrays);
        let min_arrays = self.min_arrays.min(max_arrays);
        grown.max(needed_arrays).clamp(min_arrays, max_arrays)
    }
}

impl Default for BufferGrowth {
    fn default() -> Self {
        BufferGrowth {
            min_arrays: MIN_BUFFER_ARRAYS,
            max_arrays: usize::MAX,
            grow_percent: 100,
        }
    }
}

// ============================================================================
// Array store
// ============================================================================

/// Array store options
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayStoreConfig {
    /// Arrays up to this length are stored in per-length buffers
    pub max_small_array_size: usize,
    /// Reference bit split
    pub ref_layout: RefLayout,
    /// Sizing of new buffers
    pub growth: BufferGrowth,
    /// Recycle trimmed slots for new entries of the same shape
    pub enable_free_lists: bool,
}

impl ArrayStoreConfig {
    /// Create a config with the given small array ceiling and defaults otherwise
    pub fn new(max_small_array_size: usize) -> Self {
        Self {
            max_small_array_size,
            ..Self::default()
        }
    }

    /// Largest small array ceiling the layout supports
    ///
    /// Every small length needs its own buffer type, and one more type is
    /// used for large arrays, so the ceiling must stay below the number of
    /// buffer ids. A small array must also fit the offset range.
    pub fn small_array_size_limit(&self) -> usize {
        let by_buffers = self.ref_layout.num_buffers() as usize - 1;
        let by_offsets = self.ref_layout.offset_size() - 1;
        by_buffers.min(by_offsets)
    }

    /// Check all options
    pub fn validate(&self) -> Result<()> {
        self.ref_layout.validate()?;
        if self.ref_layout.align_bits != 0 {
            return Err(Error::UnsupportedAlignment {
                align_bits: self.ref_layout.align_bits,
            });
        }
        let limit = self.small_array_size_limit();
        if self.max_small_array_size > limit {
            return Err(Error::SmallArraySizeTooLarge {
                max_small_array_size: self.max_small_array_size,
                limit,
            });
        }
        self.growth.validate()
    }
}

impl Default for ArrayStoreConfig {
    fn default() -> Self {
        ArrayStoreConfig {
            max_small_array_size: 8,
            ref_layout: RefLayout::DEFAULT,
            growth: BufferGrowth::default(),
            enable_free_lists: false,
        }
    }
}

// ============================================================================
// Index array growth
// ============================================================================

/// Growth policy for the per-document index array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowStrategy {
    /// Capacity of the first allocation
    pub initial_capacity: usize,
    /// Growth in percent of the current capacity
    pub grow_percent: u32,
    /// Minimum growth in slots
    pub grow_delta: usize,
}

impl GrowStrategy {
    /// Create a grow strategy
    pub fn new(initial_capacity: usize, grow_percent: u32, grow_delta: usize) -> Self {
        Self {
            initial_capacity,
            grow_percent,
            grow_delta,
        }
    }

    /// Check that the strategy always makes progress
    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity == 0 && self.grow_percent == 0 && self.grow_delta == 0 {
            return Err(Error::InvalidGrowStrategy(
                "strategy never grows past zero capacity".to_string(),
            ));
        }
        Ok(())
    }

    /// Capacity to move to when `current` is full
    pub fn next_capacity(&self, current: usize) -> usize {
        if current < self.initial_capacity {
            return self.initial_capacity;
        }
        let by_percent = current.saturating_mul(self.grow_percent as usize) / 100;
        current + by_percent.max(self.grow_delta).max(1)
    }
}

impl Default for GrowStrategy {
    fn default() -> Self {
        GrowStrategy {
            initial_capacity: 1024,
            grow_percent: 50,
            grow_delta: 0,
        }
    }
}

// ============================================================================
// Compaction
// ============================================================================

/// Thresholds deciding when compaction is worthwhile
///
/// Memory compaction triggers when dead bytes reach `dead_bytes_slack` and
/// exceed `max_dead_bytes_ratio` of used bytes. Address space compaction is
/// the same test on arrays, using `dead_clusters_slack` and
/// `max_dead_address_space_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionStrategy {
    /// Dead-to-used byte ratio that warrants compaction
    pub max_dead_bytes_ratio: f64,
    /// Dead-to-used array ratio that warrants compaction
    pub max_dead_address_space_ratio: f64,
    /// Dead bytes below this never trigger compaction
    pub dead_bytes_slack: usize,
    /// Dead arrays below this never trigger compaction
    pub dead_clusters_slack: usize,
}

impl CompactionStrategy {
    /// Create a strategy with default slack values
    pub fn new(max_dead_bytes_ratio: f64, max_dead_address_space_ratio: f64) -> Self {
        Self {
            max_dead_bytes_ratio,
            max_dead_address_space_ratio,
            ..Self::default()
        }
    }

    /// Check the ratios
    pub fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("max_dead_bytes_ratio", self.max_dead_bytes_ratio),
            (
                "max_dead_address_space_ratio",
                self.max_dead_address_space_ratio,
            ),
        ] {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(Error::InvalidCompactionStrategy(format!(
                    "{} must be a non-negative number, got {}",
                    name, ratio
                )));
            }
        }
        Ok(())
    }

    /// Check if dead bytes warrant memory compaction
    pub fn should_compact_memory(&self, usage: &MemoryUsage) -> bool {
        usage.dead_bytes >= self.dead_bytes_slack
            && (usage.used_bytes as f64) * self.max_dead_bytes_ratio < usage.dead_bytes as f64
    }

    /// Check if dead arrays warrant address space compaction
    pub fn should_compact_address_space(&self, space: &AddressSpace) -> bool {
        space.dead >= self.dead_clusters_slack
            && (space.used as f64) * self.max_dead_address_space_ratio < space.dead as f64
    }
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy {
            max_dead_bytes_ratio: 0.2,
            max_dead_address_space_ratio: 0.2,
            dead_bytes_slack: DEAD_BYTES_SLACK,
            dead_clusters_slack: DEAD_CLUSTERS_SLACK,
        }
    }
}
