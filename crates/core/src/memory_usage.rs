//! Memory and address space statistics
//!
//! These are plain value snapshots. Stores compute them on demand; callers
//! merge snapshots from several structures into one report.

use serde::{Deserialize, Serialize};

/// Byte-level memory statistics
///
/// - `allocated_bytes`: capacity reserved from the allocator
/// - `used_bytes`: bytes written, live or not
/// - `dead_bytes`: used bytes that are unreachable and already reclaimable
///   only by compaction
/// - `allocated_bytes_on_hold`: used bytes waiting for readers to drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes reserved from the allocator
    pub allocated_bytes: usize,
    /// Bytes written
    pub used_bytes: usize,
    /// Bytes logically freed
    pub dead_bytes: usize,
    /// Bytes waiting on a generation hold list
    pub allocated_bytes_on_hold: usize,
}

impl MemoryUsage {
    /// Create a snapshot from raw counters
    pub fn new(
        allocated_bytes: usize,
        used_bytes: usize,
        dead_bytes: usize,
        allocated_bytes_on_hold: usize,
    ) -> Self {
        Self {
            allocated_bytes,
            used_bytes,
            dead_bytes,
            allocated_bytes_on_hold,
        }
    }

    /// Add another snapshot into this one
    pub fn merge(&mut self, other: &MemoryUsage) {
        self.allocated_bytes += other.allocated_bytes;
        self.used_bytes += other.used_bytes;
        self.dead_bytes += other.dead_bytes;
        self.allocated_bytes_on_hold += other.allocated_bytes_on_hold;
    }

    /// Bytes that are written and neither dead nor on hold
    pub fn live_bytes(&self) -> usize {
        self.used_bytes
            .saturating_sub(self.dead_bytes)
            .saturating_sub(self.allocated_bytes_on_hold)
    }
}

/// Address space statistics, counted in arrays
///
/// `limit` is the number of arrays the store could address if every buffer
/// id were filled to its maximum size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    /// Arrays handed out
    pub used: usize,
    /// Handed-out arrays that are dead
    pub dead: usize,
    /// Arrays addressable in total
    pub limit: usize,
}

impl AddressSpace {
    /// Create a snapshot
    pub fn new(used: usize, dead: usize, limit: usize) -> Self {
        Self { used, dead, limit }
    }

    /// Fraction of the addressable space consumed by live and dead arrays
    pub fn usage(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}
