//! Multi-value mapping: doc id -> array of values
//!
//! ## Design
//!
//! Two layers:
//! - an [`IndexVector`] holding one [`EntryRef`] per doc id
//! - an [`ArrayStore`] holding the arrays
//!
//! Replacing a doc's array stores the new array, publishes its reference in
//! the index, and only then removes the old array. Removed arrays stay
//! readable until the hold lists are trimmed past the generation they were
//! transferred with, so a reader that loaded the old reference is safe.
//!
//! ## Thread Safety
//!
//! `MultiValueMapping` is the single writer. [`MultiValueReader`] is the
//! concurrent read handle; its lookups require a generation guard.

use crate::index_vector::{IndexReader, IndexVector};
use attrstore_core::{
    AddressSpace, ArrayStoreConfig, CompactionStrategy, EntryRef, Generation, GrowStrategy,
    MemoryUsage, Result,
};
use attrstore_storage::{ArrayStore, ArrayStoreReader};
use tracing::debug;

/// Doc id indexed arrays of `T`
///
/// # Example
///
/// ```
/// use attrstore_core::{ArrayStoreConfig, GrowStrategy};
/// use attrstore_primitives::MultiValueMapping;
///
/// let mut mapping =
///     MultiValueMapping::<i32>::new(ArrayStoreConfig::new(4), GrowStrategy::default()).unwrap();
/// let doc = mapping.add_doc();
/// mapping.set(doc, &[3, 1, 4]);
/// assert_eq!(mapping.get(doc), &[3, 1, 4]);
/// ```
pub struct MultiValueMapping<T> {
    indices: IndexVector,
    store: ArrayStore<T>,
    total_values: usize,
    cached_values_memory_usage: MemoryUsage,
    cached_values_address_space: AddressSpace,
}

impl<T: Copy + Send + Sync + 'static> MultiValueMapping<T> {
    /// Create an empty mapping
    pub fn new(config: ArrayStoreConfig, grow: GrowStrategy) -> Result<Self> {
        grow.validate()?;
        let store = ArrayStore::new(config)?;
        Ok(MultiValueMapping {
            indices: IndexVector::new(grow),
            store,
            total_values: 0,
            cached_values_memory_usage: MemoryUsage::default(),
            cached_values_address_space: AddressSpace::default(),
        })
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Append a doc with no values and return its id
    pub fn add_doc(&mut self) -> u32 {
        self.indices.push(EntryRef::INVALID)
    }

    /// Replace the values of `doc`
    ///
    /// # Panics
    ///
    /// Panics if `doc` has not been added.
    pub fn set(&mut self, doc: u32, values: &[T]) {
        let old = self.indices.get(doc);
        let new = self.store.add(values);
        self.indices.set(doc, new);
        self.total_values += values.len();
        self.remove_array(old);
    }

    /// Remove the values of `doc`
    pub fn clear_doc(&mut self, doc: u32) {
        let old = self.indices.get(doc);
        if old.is_valid() {
            self.indices.set(doc, EntryRef::INVALID);
            self.remove_array(old);
        }
    }

    fn remove_array(&mut self, r: EntryRef) {
        if r.is_valid() {
            self.total_values -= self.store.get(r).len();
            self.store.remove(r);
        }
    }

    /// Values of `doc`
    ///
    /// # Panics
    ///
    /// Panics if `doc` has not been added.
    pub fn get(&self, doc: u32) -> &[T] {
        self.store.get(self.indices.get(doc))
    }

    /// Reference stored for `doc`
    pub fn get_ref(&self, doc: u32) -> EntryRef {
        self.indices.get(doc)
    }

    /// Clear every doc in `low..limit` that has values
    ///
    /// `clean` sees each doc's values before they are removed.
    ///
    /// # Panics
    ///
    /// Panics if the range is reversed or extends past the last doc.
    pub fn clear_docs<F>(&mut self, low: u32, limit: u32, mut clean: F)
    where
        F: FnMut(u32, &[T]),
    {
        assert!(
            low <= limit && limit as usize <= self.num_docs(),
            "clear range {}..{} outside {} docs",
            low,
            limit,
            self.num_docs()
        );
        for doc in low..limit {
            let r = self.indices.get(doc);
            if r.is_valid() {
                clean(doc, self.store.get(r));
                self.indices.set(doc, EntryRef::INVALID);
                self.remove_array(r);
            }
        }
    }

    /// Make room for `capacity` docs without reallocating the index
    pub fn reserve(&mut self, capacity: usize) {
        self.indices.reserve(capacity);
    }

    /// Drop docs from `limit` on
    ///
    /// Index capacity is released on a later commit, once readers that saw
    /// the old doc id limit are gone.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is past the last doc or a dropped doc still has
    /// values.
    pub fn shrink(&mut self, limit: u32) {
        let limit = limit as usize;
        assert!(
            limit <= self.num_docs(),
            "cannot shrink {} docs to {}",
            self.num_docs(),
            limit
        );
        for doc in limit..self.num_docs() {
            assert!(
                !self.indices.get(doc as u32).is_valid(),
                "cannot shrink below doc {} which has values",
                doc
            );
        }
        self.indices.shrink(limit);
    }

    /// Number of docs
    pub fn num_docs(&self) -> usize {
        self.indices.len()
    }

    /// Docs addressable without reallocating the index
    pub fn capacity(&self) -> usize {
        self.indices.capacity()
    }

    /// Number of times the index has been reallocated
    pub fn reallocations(&self) -> u64 {
        self.indices.reallocations()
    }

    /// Values across all docs
    pub fn total_values(&self) -> usize {
        self.total_values
    }

    /// References of the first `limit` docs
    pub fn ref_copy(&self, limit: u32) -> Vec<EntryRef> {
        self.indices.ref_copy(limit as usize)
    }

    /// Underlying array store
    pub fn array_store(&self) -> &ArrayStore<T> {
        &self.store
    }

    /// Reader handle for concurrent lookups
    pub fn reader(&self) -> MultiValueReader<T> {
        MultiValueReader {
            indices: self.indices.reader(),
            values: self.store.reader(),
        }
    }

    // ========================================================================
    // Generations
    // ========================================================================

    /// Publish the current doc count to readers
    ///
    /// Call before [`transfer_hold_lists`](Self::transfer_hold_lists).
    pub fn commit_doc_id_limit(&mut self) {
        self.indices.commit_doc_id_limit();
    }

    /// Doc count published by the last commit
    pub fn committed_doc_id_limit(&self) -> usize {
        self.indices.committed_doc_id_limit()
    }

    /// Stamp removals and retired index arrays with `generation`
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.store.transfer_hold_lists(generation);
        self.indices.transfer_hold_lists(generation);
    }

    /// Release everything stamped before `first_used`
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        self.store.trim_hold_lists(first_used);
        self.indices.trim_hold_lists(first_used);
    }

    /// Release every hold regardless of generation
    pub fn clear_hold_lists(&mut self) {
        self.store.clear_hold_lists();
        self.indices.clear_hold_lists();
    }

    /// Release removals immediately while no readers exist
    pub fn set_initializing(&mut self, initializing: bool) {
        self.store.set_initializing(initializing);
    }

    // ========================================================================
    // Statistics and compaction
    // ========================================================================

    /// Byte statistics of the index and the arrays
    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.store.memory_usage();
        usage.merge(&self.indices.memory_usage());
        usage
    }

    /// Array statistics of the value store
    pub fn address_space_usage(&self) -> AddressSpace {
        self.store.address_space_usage()
    }

    /// Refresh the cached value statistics and return the full usage
    pub fn update_stat(&mut self) -> MemoryUsage {
        self.cached_values_memory_usage = self.store.memory_usage();
        self.cached_values_address_space = self.store.address_space_usage();
        self.memory_usage()
    }

    /// Compact if the statistics from the last [`update_stat`] warrant it
    ///
    /// Returns whether a compaction ran.
    ///
    /// [`update_stat`]: MultiValueMapping::update_stat
    pub fn consider_compact(&mut self, strategy: &CompactionStrategy) -> bool {
        let compact_memory = strategy.should_compact_memory(&self.cached_values_memory_usage);
        let compact_address_space =
            strategy.should_compact_address_space(&self.cached_values_address_space);
        if compact_memory || compact_address_space {
            self.compact_worst(compact_memory, compact_address_space)
        } else {
            false
        }
    }

    /// Move every array out of the worst buffers and remap the docs
    pub fn compact_worst(&mut self, compact_memory: bool, compact_address_space: bool) -> bool {
        let indices = &mut self.indices;
        let mut context = match self
            .store
            .compact_worst(compact_memory, compact_address_space)
        {
            Some(context) => context,
            None => return false,
        };
        let mut moved = 0usize;
        for doc in 0..indices.len() as u32 {
            let r = indices.get(doc);
            if context.needs_move(r) {
                indices.set(doc, context.compact_ref(r));
                moved += 1;
            }
        }
        debug!(buffers = ?context.buffer_ids(), moved, "remapped docs");
        true
    }
}

impl<T> std::fmt::Debug for MultiValueMapping<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiValueMapping")
            .field("indices", &self.indices)
            .field("total_values", &self.total_values)
            .finish()
    }
}

/// Concurrent read handle of a [`MultiValueMapping`]
pub struct MultiValueReader<T> {
    indices: IndexReader,
    values: ArrayStoreReader<T>,
}

impl<T> MultiValueReader<T> {
    /// Committed doc id limit
    pub fn num_docs(&self) -> usize {
        self.indices.len()
    }

    /// Values of `doc`
    ///
    /// # Safety
    ///
    /// The caller must hold a generation guard of the handler the writer
    /// commits through, and the slice must not outlive it.
    ///
    /// # Panics
    ///
    /// Panics if `doc` is past the published index array. Docs below a
    /// limit read from [`num_docs`](Self::num_docs) under the same guard
    /// never are.
    #[inline]
    pub unsafe fn get(&self, doc: u32) -> &[T] {
        self.values.get(self.indices.get(doc))
    }
}

impl<T> Clone for MultiValueReader<T> {
    fn clone(&self) -> Self {
        MultiValueReader {
            indices: self.indices.clone(),
            values: self.values.clone(),
        }
    }
}

impl<T> std::fmt::Debug for MultiValueReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiValueReader")
            .field("num_docs", &self.num_docs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(MultiValueMapping<u32>: Send);
    assert_impl_all!(MultiValueReader<u32>: Send, Sync, Clone);

    fn mapping() -> MultiValueMapping<u32> {
        MultiValueMapping::new(ArrayStoreConfig::new(4), GrowStrategy::new(16, 50, 0)).unwrap()
    }

    fn commit(m: &mut MultiValueMapping<u32>, generation: Generation) {
        m.transfer_hold_lists(generation);
        m.trim_hold_lists(generation + 1);
    }

    // ========================================================================
    // Documents
    // ========================================================================

    #[test]
    fn test_new_doc_has_no_values() {
        let mut m = mapping();
        let doc = m.add_doc();
        assert_eq!(doc, 0);
        assert!(m.get(doc).is_empty());
        assert_eq!(m.get_ref(doc), EntryRef::INVALID);
    }

    #[test]
    fn test_set_replaces_values() {
        let mut m = mapping();
        let doc = m.add_doc();
        m.set(doc, &[1, 2, 3]);
        assert_eq!(m.get(doc), &[1, 2, 3]);
        m.set(doc, &[4, 5, 6, 7, 8, 9]);
        assert_eq!(m.get(doc), &[4, 5, 6, 7, 8, 9]);
        assert_eq!(m.total_values(), 6);
        m.set(doc, &[]);
        assert!(m.get(doc).is_empty());
        assert_eq!(m.total_values(), 0);
    }

    #[test]
    fn test_replaced_array_held_until_trim() {
        let mut m = mapping();
        let doc = m.add_doc();
        m.set(doc, &[1, 2]);
        let old = m.get_ref(doc);
        m.set(doc, &[3]);
        assert_eq!(m.array_store().get(old), &[1, 2]);
        assert_eq!(m.array_store().buffer_state(old).hold_elems(), 2);
        commit(&mut m, 0);
        assert_eq!(m.array_store().buffer_state(old).hold_elems(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_unknown_doc_panics() {
        let mut m = mapping();
        m.set(3, &[1]);
    }

    #[test]
    fn test_clear_docs_visits_valid_docs() {
        let mut m = mapping();
        for i in 0..10 {
            let doc = m.add_doc();
            if i % 2 == 0 {
                m.set(doc, &[i, i + 1]);
            }
        }
        let mut seen = Vec::new();
        m.clear_docs(2, 8, |doc, values| seen.push((doc, values.to_vec())));
        assert_eq!(
            seen,
            vec![(2, vec![2, 3]), (4, vec![4, 5]), (6, vec![6, 7])]
        );
        for doc in 2..8 {
            assert!(m.get(doc).is_empty());
        }
        assert_eq!(m.get(0), &[0, 1]);
        assert_eq!(m.get(8), &[8, 9]);
        assert_eq!(m.total_values(), 4);
    }

    #[test]
    fn test_shrink_after_clear() {
        let mut m = mapping();
        for i in 0..10 {
            let doc = m.add_doc();
            m.set(doc, &[i]);
        }
        m.clear_docs(6, 10, |_, _| {});
        m.shrink(6);
        assert_eq!(m.num_docs(), 6);
        assert_eq!(m.add_doc(), 6);
    }

    #[test]
    #[should_panic(expected = "which has values")]
    fn test_shrink_below_live_doc_panics() {
        let mut m = mapping();
        let doc = m.add_doc();
        m.set(doc, &[1]);
        m.shrink(0);
    }

    #[test]
    fn test_reserve_avoids_reallocation() {
        let mut m = mapping();
        m.reserve(500);
        let before = m.reallocations();
        for expected in 0..500 {
            assert_eq!(m.add_doc(), expected);
        }
        assert_eq!(m.reallocations(), before);
    }

    #[test]
    fn test_ref_copy() {
        let mut m = mapping();
        for i in 0..4 {
            let doc = m.add_doc();
            m.set(doc, &[i]);
        }
        let refs = m.ref_copy(3);
        assert_eq!(refs.len(), 3);
        for (doc, r) in refs.iter().enumerate() {
            assert_eq!(*r, m.get_ref(doc as u32));
        }
    }

    // ========================================================================
    // Statistics and compaction
    // ========================================================================

    #[test]
    fn test_memory_usage_includes_index() {
        let mut m = mapping();
        m.add_doc();
        let usage = m.memory_usage();
        assert_eq!(usage.used_bytes, 4);
        assert!(usage.allocated_bytes >= 16 * 4);
    }

    #[test]
    fn test_consider_compact_uses_cached_stats() {
        let mut m = mapping();
        for i in 0..2000 {
            let doc = m.add_doc();
            m.set(doc, &[i, i]);
        }
        m.clear_docs(100, 2000, |_, _| {});
        commit(&mut m, 0);

        let strategy = CompactionStrategy {
            dead_bytes_slack: 1000,
            dead_clusters_slack: 1000,
            ..CompactionStrategy::default()
        };
        // Stale statistics: nothing looked dead yet
        assert!(!m.consider_compact(&strategy));

        let before = m.update_stat();
        assert!(m.consider_compact(&strategy));
        commit(&mut m, 1);
        let after = m.update_stat();
        assert!(after.dead_bytes < before.dead_bytes);
        assert!(after.used_bytes <= before.used_bytes);
        for doc in 0..100 {
            assert_eq!(m.get(doc), &[doc, doc]);
        }

        // The first buffer still has most of its arrays dead
        assert!(m.consider_compact(&strategy));
        commit(&mut m, 2);
        for doc in 0..100 {
            assert_eq!(m.get(doc), &[doc, doc]);
        }
        assert_eq!(m.total_values(), 200);
    }

    #[test]
    fn test_compact_worst_without_dead_entries() {
        let mut m = mapping();
        let doc = m.add_doc();
        m.set(doc, &[1]);
        assert!(!m.compact_worst(true, true));
    }

    #[test]
    fn test_reader_follows_writer() {
        let mut m = mapping();
        let reader = m.reader();
        let doc = m.add_doc();
        m.set(doc, &[9, 8, 7, 6, 5]);
        unsafe {
            assert_eq!(reader.get(doc), &[9, 8, 7, 6, 5]);
        }
        assert_eq!(reader.num_docs(), 0);
        m.commit_doc_id_limit();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(m.committed_doc_id_limit(), 1);
    }

    proptest! {
        #[test]
        fn prop_doc_ids_increase_from_zero(n in 0usize..300, reserve in 0usize..300) {
            let mut m = mapping();
            m.reserve(reserve);
            for expected in 0..n as u32 {
                prop_assert_eq!(m.add_doc(), expected);
            }
            prop_assert_eq!(m.num_docs(), n);
        }

        #[test]
        fn prop_last_set_wins(ops in proptest::collection::vec(
            (0u32..8, proptest::collection::vec(any::<u32>(), 0..10)), 1..60)) {
            let mut m = mapping();
            for _ in 0..8 {
                m.add_doc();
            }
            let mut expected: Vec<Vec<u32>> = vec![Vec::new(); 8];
            for (generation, (doc, values)) in ops.iter().enumerate() {
                m.set(*doc, values);
                expected[*doc as usize] = values.clone();
                commit(&mut m, generation as Generation);
            }
            for (doc, values) in expected.iter().enumerate() {
                prop_assert_eq!(m.get(doc as u32), values.as_slice());
            }
            prop_assert_eq!(m.total_values(), expected.iter().map(Vec::len).sum::<usize>());
        }
    }
}
