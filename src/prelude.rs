//! Convenient imports for attrstore.
//!
//! ```
//! use attrstore::prelude::*;
//!
//! let attr = AttributeBuilder::new("scores").build::<i64>()?;
//! let doc = attr.add_doc();
//! attr.set(doc, &[10, 20]);
//! # Ok::<(), attrstore::Error>(())
//! ```

// Main entry point
pub use crate::builder::{AttributeBuilder, AttributeConfig};

// Error handling
pub use crate::error::{Error, Result};

// Attribute types
pub use crate::types::{MultiValueAttribute, ReadGuard};

// Statistics and configuration
pub use crate::types::{CompactionStrategy, GrowStrategy, MemoryUsage};
