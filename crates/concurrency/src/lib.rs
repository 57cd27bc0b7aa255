//! Generation-based reclamation for attrstore
//!
//! This crate implements the reader/writer protocol shared by every store:
//! - GenerationHandler: current generation and oldest generation in use
//! - GenerationGuard: a reader's pin on one generation
//! - HoldList: two-stage list of retired items tagged with a generation
//! - GenerationHolder: deferred destruction of replaced heap structures
//!
//! ## Writer commit sequence
//!
//! ```text
//! 1. transfer_hold_lists(current_generation)
//! 2. inc_generation()
//! 3. trim_hold_lists(first_used_generation)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod generation;
pub mod generation_holder;
pub mod hold_list;

pub use attrstore_core::Generation;
pub use generation::{GenerationGuard, GenerationHandler};
pub use generation_holder::{GenerationHeld, GenerationHolder};
pub use hold_list::HoldList;
