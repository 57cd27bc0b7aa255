//! # attrstore
//!
//! Generation-reclaimed arena storage for multi-value attribute fields.
//!
//! attrstore keeps a variable-length array of values per document id. One
//! writer updates documents while any number of readers look them up
//! without locks. Replaced arrays are reclaimed only after every reader
//! that could still see them has moved on.
//!
//! ## Quick Start
//!
//! ```
//! use attrstore::prelude::*;
//!
//! let attr = AttributeBuilder::new("tags").build::<u32>()?;
//!
//! let doc = attr.add_doc();
//! attr.set(doc, &[3, 1, 4]);
//! attr.commit();
//!
//! let read = attr.read();
//! assert_eq!(read.get(doc), &[3, 1, 4]);
//! # Ok::<(), attrstore::Error>(())
//! ```
//!
//! ## Layers
//!
//! - [`attrstore_core`]: entry references, configuration, statistics
//! - [`attrstore_concurrency`]: generation handler, guards, hold lists
//! - [`attrstore_storage`]: buffers, data store, array store, compaction
//! - [`attrstore_primitives`]: doc id mapping and the attribute facade
//!
//! ## Memory reclamation
//!
//! Every [`MultiValueAttribute::commit`] advances the generation and frees
//! memory retired before the oldest generation a reader still pins. Call
//! [`MultiValueAttribute::update_stat`] and
//! [`MultiValueAttribute::consider_compact`] between commits to move live
//! arrays out of buffers that are mostly dead.

#![warn(missing_docs)]

mod builder;
mod error;
mod types;

pub mod prelude;

// Re-export main entry points
pub use builder::{AttributeBuilder, AttributeConfig};
pub use error::{Error, Result};

// Re-export types
pub use types::*;

// Re-export layer crates
pub use attrstore_concurrency;
pub use attrstore_core;
pub use attrstore_primitives;
pub use attrstore_storage;
