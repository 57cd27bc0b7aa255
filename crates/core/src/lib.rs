//! Core types for attrstore
//!
//! This crate defines the vocabulary shared by every layer:
//! - EntryRef / RefLayout: compact 32-bit handles to stored entries
//! - Generation: writer epoch counter
//! - Error / Result: configuration and resource errors
//! - MemoryUsage / AddressSpace: statistics snapshots
//! - Config: buffer growth, array store, index growth and compaction options

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod memory_usage;
pub mod types;

pub use config::{
    ArrayStoreConfig, BufferGrowth, CompactionStrategy, GrowStrategy, DEAD_BYTES_SLACK,
    DEAD_CLUSTERS_SLACK, MIN_BUFFER_ARRAYS,
};
pub use error::{Error, Result};
pub use memory_usage::{AddressSpace, MemoryUsage};
pub use types::{EntryRef, Generation, RefLayout};
