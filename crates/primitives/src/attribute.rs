//! Thread-safe multi-value attribute
//!
//! ## Design
//!
//! `MultiValueAttribute` pairs a [`MultiValueMapping`] with a
//! [`GenerationHandler`]. Writer calls serialize on a mutex around the
//! mapping; reads take a generation guard and never lock.
//!
//! Changes become reclaimable on [`commit`](MultiValueAttribute::commit):
//!
//! ```text
//! 1. commit_doc_id_limit()
//! 2. transfer_hold_lists(current_generation)
//! 3. inc_generation()
//! 4. trim_hold_lists(first_used_generation)
//! ```
//!
//! A [`ReadGuard`] sees the doc id limit committed when it was taken, so
//! docs added since are invisible to it and docs shrunk away stay readable
//! (as empty) until it is dropped.
//!
//! A reader that never drops its guard stalls step 4. The gap between the
//! current and the first used generation is logged as a warning once it
//! reaches the configured threshold.

use crate::multi_value_mapping::{MultiValueMapping, MultiValueReader};
use attrstore_concurrency::{GenerationGuard, GenerationHandler};
use attrstore_core::{AddressSpace, CompactionStrategy, Generation, MemoryUsage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default generation lag at which commits warn about stalled readers
pub const DEFAULT_GENERATION_LAG_WARNING: u64 = 1000;

struct AttributeWriter<T> {
    mapping: MultiValueMapping<T>,
    compaction: CompactionStrategy,
}

struct Inner<T> {
    name: String,
    handler: GenerationHandler,
    reader: MultiValueReader<T>,
    writer: Mutex<AttributeWriter<T>>,
    lag_warning: AtomicU64,
}

/// Multi-value attribute shared between one writer and many readers
///
/// Cloning is cheap and yields a handle to the same attribute.
///
/// # Example
///
/// ```
/// use attrstore_core::{ArrayStoreConfig, CompactionStrategy, GrowStrategy};
/// use attrstore_primitives::{MultiValueAttribute, MultiValueMapping};
///
/// let mapping =
///     MultiValueMapping::<u32>::new(ArrayStoreConfig::new(4), GrowStrategy::default()).unwrap();
/// let attr = MultiValueAttribute::new("tags", mapping, CompactionStrategy::default());
/// let doc = attr.add_doc();
/// attr.set(doc, &[7, 11]);
/// attr.commit();
///
/// let read = attr.read();
/// assert_eq!(read.get(doc), &[7, 11]);
/// ```
pub struct MultiValueAttribute<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy + Send + Sync + 'static> MultiValueAttribute<T> {
    /// Wrap `mapping` under `name`
    pub fn new(
        name: impl Into<String>,
        mapping: MultiValueMapping<T>,
        compaction: CompactionStrategy,
    ) -> Self {
        let reader = mapping.reader();
        MultiValueAttribute {
            inner: Arc::new(Inner {
                name: name.into(),
                handler: GenerationHandler::new(),
                reader,
                writer: Mutex::new(AttributeWriter {
                    mapping,
                    compaction,
                }),
                lag_warning: AtomicU64::new(DEFAULT_GENERATION_LAG_WARNING),
            }),
        }
    }

    /// Attribute name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Generation lag at which commits log a warning
    pub fn set_generation_lag_warning(&self, lag: u64) {
        self.inner.lag_warning.store(lag.max(1), Ordering::Relaxed);
    }

    // ========================================================================
    // Writer
    // ========================================================================

    /// Append a doc with no values and return its id
    pub fn add_doc(&self) -> u32 {
        self.inner.writer.lock().mapping.add_doc()
    }

    /// Replace the values of `doc`
    pub fn set(&self, doc: u32, values: &[T]) {
        self.inner.writer.lock().mapping.set(doc, values);
    }

    /// Remove the values of `doc`
    pub fn clear_doc(&self, doc: u32) {
        self.inner.writer.lock().mapping.clear_doc(doc);
    }

    /// Clear every doc in `low..limit`, passing its values to `clean` first
    pub fn clear_docs<F>(&self, low: u32, limit: u32, clean: F)
    where
        F: FnMut(u32, &[T]),
    {
        self.inner
            .writer
            .lock()
            .mapping
            .clear_docs(low, limit, clean);
    }

    /// Make room for `capacity` docs
    pub fn reserve(&self, capacity: usize) {
        self.inner.writer.lock().mapping.reserve(capacity);
    }

    /// Drop docs from `limit` on
    pub fn shrink(&self, limit: u32) {
        self.inner.writer.lock().mapping.shrink(limit);
    }

    /// Copy of the values of `doc` as seen by the writer
    pub fn get_copy(&self, doc: u32) -> Vec<T> {
        self.inner.writer.lock().mapping.get(doc).to_vec()
    }

    /// Make pending changes reclaimable and release what readers no longer see
    pub fn commit(&self) {
        let mut writer = self.inner.writer.lock();
        let handler = &self.inner.handler;
        writer.mapping.commit_doc_id_limit();
        writer
            .mapping
            .transfer_hold_lists(handler.current_generation());
        handler.inc_generation();
        let first_used = handler.first_used_generation();
        writer.mapping.trim_hold_lists(first_used);

        let current = handler.current_generation();
        let lag = current - first_used;
        let threshold = self.inner.lag_warning.load(Ordering::Relaxed);
        if lag >= threshold && lag % threshold == 0 {
            warn!(
                attribute = %self.inner.name,
                current_generation = current,
                first_used_generation = first_used,
                lag,
                "readers are holding back memory reclamation"
            );
        }
    }

    // ========================================================================
    // Statistics and compaction
    // ========================================================================

    /// Refresh cached statistics and return the memory usage
    pub fn update_stat(&self) -> MemoryUsage {
        self.inner.writer.lock().mapping.update_stat()
    }

    /// Compact if the statistics from the last update warrant it
    ///
    /// Moved arrays become reclaimable on the next commit.
    pub fn consider_compact(&self) -> bool {
        let mut writer = self.inner.writer.lock();
        let strategy = writer.compaction;
        let compacted = writer.mapping.consider_compact(&strategy);
        if compacted {
            debug!(attribute = %self.inner.name, "compacted values");
        }
        compacted
    }

    /// Byte statistics
    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner.writer.lock().mapping.memory_usage()
    }

    /// Array statistics of the value store
    pub fn address_space_usage(&self) -> AddressSpace {
        self.inner.writer.lock().mapping.address_space_usage()
    }

    /// Number of docs
    pub fn num_docs(&self) -> usize {
        self.inner.writer.lock().mapping.num_docs()
    }

    /// Values across all docs
    pub fn total_values(&self) -> usize {
        self.inner.writer.lock().mapping.total_values()
    }

    /// Number of times the doc id index has been reallocated
    pub fn reallocations(&self) -> u64 {
        self.inner.writer.lock().mapping.reallocations()
    }

    // ========================================================================
    // Readers
    // ========================================================================

    /// Pin the current generation for lock-free reads
    pub fn read(&self) -> ReadGuard<'_, T> {
        let guard = self.inner.handler.take_guard();
        // The limit must be read under the guard
        let doc_id_limit = self.inner.reader.num_docs();
        ReadGuard {
            guard,
            reader: &self.inner.reader,
            doc_id_limit,
        }
    }

    /// Current generation
    pub fn current_generation(&self) -> Generation {
        self.inner.handler.current_generation()
    }

    /// Oldest generation possibly pinned by a reader
    pub fn first_used_generation(&self) -> Generation {
        self.inner.handler.first_used_generation()
    }

    /// Number of open read guards
    pub fn reader_count(&self) -> u64 {
        self.inner.handler.total_ref_count()
    }
}

impl<T> Clone for MultiValueAttribute<T> {
    fn clone(&self) -> Self {
        MultiValueAttribute {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for MultiValueAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiValueAttribute")
            .field("name", &self.inner.name)
            .field("handler", &self.inner.handler)
            .finish()
    }
}

/// Lock-free view of an attribute at a pinned generation
pub struct ReadGuard<'a, T> {
    guard: GenerationGuard<'a>,
    reader: &'a MultiValueReader<T>,
    doc_id_limit: usize,
}

impl<T> ReadGuard<'_, T> {
    /// Values of `doc`
    ///
    /// # Panics
    ///
    /// Panics if `doc` is not below [`num_docs`](Self::num_docs).
    #[inline]
    pub fn get(&self, doc: u32) -> &[T] {
        assert!(
            (doc as usize) < self.doc_id_limit,
            "doc id {} out of range",
            doc
        );
        // SAFETY: the guard pins the generation for as long as `self` lives,
        // and the index array keeps a slot for every doc below the limit
        // committed before the guard was taken
        unsafe { self.reader.get(doc) }
    }

    /// Doc id limit committed when this reader was created
    pub fn num_docs(&self) -> usize {
        self.doc_id_limit
    }

    /// Generation pinned by this reader
    pub fn generation(&self) -> Generation {
        self.guard.generation()
    }
}

impl<T> std::fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuard")
            .field("generation", &self.generation())
            .field("num_docs", &self.doc_id_limit)
            .finish()
    }
}
