//! Generation-reclaimed arena storage
//!
//! This crate implements the buffer layer of the attribute store:
//! - BufferType: closed set of entry shapes (small inline arrays, large heap arrays)
//! - BufferState: per-buffer lifecycle and element accounting
//! - DataStore: buffer ids, allocation, hold lists, statistics and compaction
//! - ArrayStore: variable-length arrays addressed by 32-bit references
//!
//! # Thread Safety
//!
//! Every store has a single writer. Readers go through [`BufferTable`]
//! (shared via `Arc`) and are safe only while they hold a generation guard
//! from `attrstore-concurrency`; the writer never frees memory that a guard
//! may still observe.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array_store;
pub mod buffer_state;
pub mod buffer_type;
pub mod data_store;

pub use array_store::{ArrayStore, ArrayStoreReader, CompactionContext, LARGE_ARRAY_TYPE_ID};
pub use buffer_state::{BufferState, BufferStatus, BufferTable};
pub use buffer_type::{BufferKind, BufferType, LargeArrayEntry};
pub use data_store::{DataStore, MemStats, RawAlloc};
