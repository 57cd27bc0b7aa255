//! Error types for the arena data store
//!
//! Only configuration problems are recoverable. Resource exhaustion is
//! fatal: the variants below that describe it are formatted into the panic
//! message at the point of failure, never returned.

use thiserror::Error;

/// Result type for fallible store operations
pub type Result<T> = std::result::Result<T, Error>;

/// All errors raised by the data store crates
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Reference bit split does not fit a 32-bit handle
    #[error(
        "invalid reference layout: {offset_bits} offset bits, {buffer_bits} buffer bits, {align_bits} align bits"
    )]
    InvalidRefLayout {
        /// Requested offset bits
        offset_bits: u32,
        /// Requested buffer id bits
        buffer_bits: u32,
        /// Requested alignment bits
        align_bits: u32,
    },

    /// Array references address whole arrays and cannot be aligned
    #[error("array store references cannot use offset alignment (align_bits = {align_bits})")]
    UnsupportedAlignment {
        /// Requested alignment bits
        align_bits: u32,
    },

    /// Small array ceiling does not fit the reference layout
    #[error("max small array size {max_small_array_size} exceeds limit {limit}")]
    SmallArraySizeTooLarge {
        /// Requested ceiling
        max_small_array_size: usize,
        /// Largest ceiling the layout supports
        limit: usize,
    },

    /// Buffer growth parameters are inconsistent
    #[error("invalid buffer growth: {0}")]
    InvalidBufferGrowth(String),

    /// Index array grow strategy is inconsistent
    #[error("invalid grow strategy: {0}")]
    InvalidGrowStrategy(String),

    /// Compaction thresholds are not usable
    #[error("invalid compaction strategy: {0}")]
    InvalidCompactionStrategy(String),

    /// Every buffer id is in use (fatal)
    #[error("buffer ids exhausted: all {num_buffers} buffers are active or on hold")]
    BuffersExhausted {
        /// Number of buffer ids in the layout
        num_buffers: u32,
    },

    /// A request exceeds what a single buffer can address (fatal)
    #[error("{resource} capacity exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded {
        /// What ran out
        resource: &'static str,
        /// Requested amount
        requested: usize,
        /// Maximum amount
        limit: usize,
    },
}

impl Error {
    /// Check if this error came from validating configuration
    pub fn is_config_error(&self) -> bool {
        !self.is_fatal()
    }

    /// Check if this error describes an unrecoverable resource condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BuffersExhausted { .. } | Error::CapacityExceeded { .. }
        )
    }
}
