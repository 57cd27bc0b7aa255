//! Public types for the attrstore API.
//!
//! This module re-exports types from the layer crates with a flat public
//! interface.

// References and configuration
pub use attrstore_core::{
    AddressSpace, ArrayStoreConfig, BufferGrowth, CompactionStrategy, EntryRef, Generation,
    GrowStrategy, MemoryUsage, RefLayout,
};

// Generations
pub use attrstore_concurrency::{GenerationGuard, GenerationHandler};

// Stores
pub use attrstore_storage::{ArrayStore, ArrayStoreReader, CompactionContext, MemStats};

// Attributes
pub use attrstore_primitives::{MultiValueAttribute, MultiValueMapping, MultiValueReader, ReadGuard};
