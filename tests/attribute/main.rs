//! Attribute Integration Tests
//!
//! Tests for the public attrstore API: generation safety, compaction,
//! doc id lifecycle and concurrent readers.

mod common;

mod compaction;
mod concurrent_readers;
mod doc_ids;
mod generation_safety;
