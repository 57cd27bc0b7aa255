//! Attribute primitives for attrstore
//!
//! This crate builds doc id addressed attributes on the storage layer:
//! - IndexVector: generation-protected doc id -> reference array
//! - MultiValueMapping: doc id -> array of values, with stats and compaction
//! - MultiValueAttribute: single-writer, many-reader facade with `commit`
//!
//! ## Thread Safety
//!
//! `IndexVector` and `MultiValueMapping` are writer-side types; their
//! reader handles are only safe to use under a generation guard.
//! `MultiValueAttribute` wraps both sides and is `Send + Sync`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod index_vector;
pub mod multi_value_mapping;

pub use attribute::{MultiValueAttribute, ReadGuard, DEFAULT_GENERATION_LAG_WARNING};
pub use index_vector::{IndexReader, IndexVector};
pub use multi_value_mapping::{MultiValueMapping, MultiValueReader};
