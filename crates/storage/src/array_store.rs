//! Array store: variable-length arrays on top of the data store
//!
//! Arrays of length `1..=max_small_array_size` live inline in buffers
//! dedicated to that exact length; the reference offset is the array index
//! inside the buffer, so no length header is stored. Longer arrays are copied
//! to the heap and stored as one [`LargeArrayEntry`] per reference. Empty
//! arrays map to [`EntryRef::INVALID`] without allocating.
//!
//! Type ids are fixed at construction: the large array type is registered
//! first and gets id 0, then small array types are registered in order of
//! length, so a small type id equals its array length. Readers decode the
//! array length from the buffer's type id alone.

use crate::buffer_state::{BufferState, BufferTable};
use crate::buffer_type::{BufferType, LargeArrayEntry};
use crate::data_store::{DataStore, MemStats};
use attrstore_core::{
    AddressSpace, ArrayStoreConfig, EntryRef, Generation, MemoryUsage, RefLayout, Result,
};
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::Arc;

/// Type id of the large array buffer type
pub const LARGE_ARRAY_TYPE_ID: u32 = 0;

/// Store of `T` arrays addressed by [`EntryRef`]
///
/// # Example
///
/// ```
/// use attrstore_core::ArrayStoreConfig;
/// use attrstore_storage::ArrayStore;
///
/// let mut store = ArrayStore::<u32>::new(ArrayStoreConfig::new(4)).unwrap();
/// let r = store.add(&[1, 2, 3]);
/// assert_eq!(store.get(r), &[1, 2, 3]);
/// ```
pub struct ArrayStore<T> {
    store: DataStore,
    config: ArrayStoreConfig,
    _marker: PhantomData<T>,
}

impl<T: Copy + Send + Sync + 'static> ArrayStore<T> {
    /// Create a store, registering one buffer type per small length
    pub fn new(config: ArrayStoreConfig) -> Result<Self> {
        config.validate()?;
        let mut store = DataStore::new(config.ref_layout)?;
        let large_type_id = store.add_type(BufferType::large_array::<T>(config.growth));
        debug_assert_eq!(large_type_id, LARGE_ARRAY_TYPE_ID);
        for array_size in 1..=config.max_small_array_size {
            let type_id = store.add_type(BufferType::small_array::<T>(array_size, config.growth));
            debug_assert_eq!(type_id as usize, array_size);
        }
        if config.enable_free_lists {
            store.enable_free_lists();
        }
        Ok(ArrayStore {
            store,
            config,
            _marker: PhantomData,
        })
    }

    /// Options the store was created with
    pub fn config(&self) -> &ArrayStoreConfig {
        &self.config
    }

    /// Longest array stored inline
    pub fn max_small_array_size(&self) -> usize {
        self.config.max_small_array_size
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Store a copy of `values`
    pub fn add(&mut self, values: &[T]) -> EntryRef {
        if values.is_empty() {
            EntryRef::INVALID
        } else if values.len() <= self.config.max_small_array_size {
            self.add_small_array(values)
        } else {
            self.add_large_array(values)
        }
    }

    fn add_small_array(&mut self, values: &[T]) -> EntryRef {
        let type_id = values.len() as u32;
        let alloc = self.store.alloc(type_id, values.len());
        // SAFETY: the allocation holds `values.len()` elements of `T`
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), alloc.data as *mut T, values.len());
        }
        self.store.make_ref(alloc.buffer_id, alloc.elem_offset)
    }

    fn add_large_array(&mut self, values: &[T]) -> EntryRef {
        let alloc = self.store.alloc(LARGE_ARRAY_TYPE_ID, 1);
        // SAFETY: the slot is unused or released, so overwriting it leaks nothing
        unsafe {
            ptr::write(
                alloc.data as *mut LargeArrayEntry,
                LargeArrayEntry::new(values),
            );
        }
        self.store
            .inc_extra_used_bytes(alloc.buffer_id, mem::size_of_val(values));
        self.store.make_ref(alloc.buffer_id, alloc.elem_offset)
    }

    /// View the array behind `r`
    ///
    /// The invalid reference yields an empty slice.
    ///
    /// # Panics
    ///
    /// Panics if `r` points into a free buffer.
    pub fn get(&self, r: EntryRef) -> &[T] {
        if !r.is_valid() {
            return &[];
        }
        let buffer_id = self.store.layout().buffer_id(r);
        assert!(
            self.store.buffer_state(buffer_id).is_readable(),
            "reference {} into free buffer {}",
            r,
            buffer_id
        );
        // SAFETY: buffers are only freed through `&mut self`
        unsafe { resolve(self.store.table(), self.store.layout(), r) }
    }

    /// Remove the array behind `r`
    ///
    /// The memory stays readable until the hold lists are trimmed past the
    /// generation the removal is transferred with.
    pub fn remove(&mut self, r: EntryRef) {
        if !r.is_valid() {
            return;
        }
        let buffer_id = self.store.layout().buffer_id(r);
        let type_id = match self.store.type_id_of(buffer_id) {
            Some(type_id) => type_id,
            None => panic!("reference {} into free buffer {}", r, buffer_id),
        };
        if type_id == LARGE_ARRAY_TYPE_ID {
            let extra_bytes = mem::size_of_val(self.get(r));
            self.store.hold_elem(r, 1, extra_bytes);
        } else {
            self.store.hold_elem(r, type_id as usize, 0);
        }
    }

    /// Type id of the buffer behind a valid reference
    pub fn type_id_of(&self, r: EntryRef) -> Option<u32> {
        if !r.is_valid() {
            return None;
        }
        self.store.type_id_of(self.store.layout().buffer_id(r))
    }

    /// State of the buffer behind a valid reference
    pub fn buffer_state(&self, r: EntryRef) -> &BufferState {
        self.store.buffer_state(self.store.layout().buffer_id(r))
    }

    /// Underlying data store
    pub fn data_store(&self) -> &DataStore {
        &self.store
    }

    /// Reader handle for concurrent lookups
    pub fn reader(&self) -> ArrayStoreReader<T> {
        ArrayStoreReader {
            table: Arc::clone(self.store.table()),
            layout: self.store.layout(),
            _marker: PhantomData,
        }
    }

    // ========================================================================
    // Generations
    // ========================================================================

    /// Stamp pending removals with `generation`
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.store.transfer_hold_lists(generation);
    }

    /// Release removals stamped before `first_used`
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        self.store.trim_hold_lists(first_used);
    }

    /// Release every removal regardless of generation
    pub fn clear_hold_lists(&mut self) {
        self.store.clear_hold_lists();
    }

    /// Release removals immediately while no readers exist
    pub fn set_initializing(&mut self, initializing: bool) {
        self.store.set_initializing(initializing);
    }

    // ========================================================================
    // Statistics and compaction
    // ========================================================================

    /// Byte statistics
    pub fn memory_usage(&self) -> MemoryUsage {
        self.store.memory_usage()
    }

    /// Array statistics
    pub fn address_space_usage(&self) -> AddressSpace {
        self.store.address_space_usage()
    }

    /// Element, byte and buffer counts
    pub fn mem_stats(&self) -> MemStats {
        self.store.mem_stats()
    }

    /// Start compacting the worst buffers
    ///
    /// Returns `None` when no buffer has dead entries of the requested kind.
    /// Every reference into the picked buffers must be passed through the
    /// returned context before it is dropped; dropping it puts the buffers
    /// on hold.
    pub fn compact_worst(
        &mut self,
        compact_memory: bool,
        compact_address_space: bool,
    ) -> Option<CompactionContext<'_, T>> {
        let buffer_ids = self
            .store
            .start_compact_worst_buffers(compact_memory, compact_address_space);
        if buffer_ids.is_empty() {
            return None;
        }
        Some(CompactionContext {
            store: self,
            buffer_ids,
        })
    }
}

impl<T> std::fmt::Debug for ArrayStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStore")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}

/// Decode `r` into a slice
///
/// # Safety
///
/// `r` must come from the store owning `table`, and the buffer it points
/// into must not be freed while the slice is in use.
unsafe fn resolve<T>(table: &BufferTable, layout: RefLayout, r: EntryRef) -> &[T] {
    if !r.is_valid() {
        return &[];
    }
    let buffer_id = layout.buffer_id(r);
    let offset = layout.offset(r);
    let type_id = table.type_id(buffer_id);
    if type_id == LARGE_ARRAY_TYPE_ID {
        let entry = &*table.entry::<LargeArrayEntry>(buffer_id, offset);
        entry.as_slice::<T>()
    } else {
        let array_size = type_id as usize;
        slice::from_raw_parts(table.entry::<T>(buffer_id, offset * array_size), array_size)
    }
}

/// Lock-free read access to an [`ArrayStore`]
///
/// Holds the buffer table only. Lookups are valid while the caller holds a
/// generation guard taken before the reference was loaded.
pub struct ArrayStoreReader<T> {
    table: Arc<BufferTable>,
    layout: RefLayout,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArrayStoreReader<T> {
    /// View the array behind `r`
    ///
    /// # Safety
    ///
    /// `r` must come from the store this reader was created from and must
    /// have been loaded while the caller's current generation guard was held.
    /// The returned slice must not outlive that guard.
    #[inline]
    pub unsafe fn get(&self, r: EntryRef) -> &[T] {
        resolve(&self.table, self.layout, r)
    }
}

impl<T> Clone for ArrayStoreReader<T> {
    fn clone(&self) -> Self {
        ArrayStoreReader {
            table: Arc::clone(&self.table),
            layout: self.layout,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ArrayStoreReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStoreReader")
            .field("layout", &self.layout)
            .finish()
    }
}

/// Moves live arrays out of buffers picked for compaction
///
/// Dropping the context puts the picked buffers on hold.
pub struct CompactionContext<'a, T: Copy + Send + Sync + 'static> {
    store: &'a mut ArrayStore<T>,
    buffer_ids: SmallVec<[u32; 2]>,
}

impl<'a, T: Copy + Send + Sync + 'static> CompactionContext<'a, T> {
    /// Buffers being compacted
    pub fn buffer_ids(&self) -> &[u32] {
        &self.buffer_ids
    }

    /// Check if `r` points into a buffer being compacted
    pub fn needs_move(&self, r: EntryRef) -> bool {
        r.is_valid()
            && self
                .buffer_ids
                .contains(&self.store.store.layout().buffer_id(r))
    }

    /// Copy the array behind `r` out of a compacting buffer
    ///
    /// Returns the new reference, or `r` itself if it needs no move.
    pub fn compact_ref(&mut self, r: EntryRef) -> EntryRef {
        if !self.needs_move(r) {
            return r;
        }
        let values: SmallVec<[T; 8]> = self.store.get(r).iter().copied().collect();
        self.store.add(&values)
    }

    /// Rewrite every reference in `refs` that points into a compacting buffer
    pub fn compact(&mut self, refs: &mut [EntryRef]) {
        for r in refs.iter_mut() {
            *r = self.compact_ref(*r);
        }
    }
}

impl<T: Copy + Send + Sync + 'static> Drop for CompactionContext<'_, T> {
    fn drop(&mut self) {
        self.store.store.finish_compact(&self.buffer_ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrstore_core::BufferGrowth;
    use proptest::prelude::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ArrayStore<u32>: Send);
    assert_impl_all!(ArrayStoreReader<u64>: Send, Sync, Clone);

    fn store(max_small: usize) -> ArrayStore<u32> {
        ArrayStore::new(ArrayStoreConfig::new(max_small)).unwrap()
    }

    fn values(len: usize, seed: u32) -> Vec<u32> {
        (0..len as u32).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect()
    }

    // ========================================================================
    // Add / get
    // ========================================================================

    #[test]
    fn test_boundary_lengths_round_trip() {
        let mut s = store(3);
        for len in [2, 3, 4] {
            let v = values(len, len as u32);
            let r = s.add(&v);
            assert_eq!(s.get(r), v.as_slice());
        }
    }

    #[test]
    fn test_empty_array_is_invalid_and_free() {
        let mut s = store(3);
        let before = s.memory_usage();
        let r = s.add(&[]);
        assert_eq!(r, EntryRef::INVALID);
        assert!(s.get(r).is_empty());
        assert_eq!(s.memory_usage(), before);
        assert_eq!(s.mem_stats().active_buffers, 0);
        s.remove(r);
    }

    #[test]
    fn test_small_and_large_routing() {
        let mut s = store(3);
        let small = s.add(&values(3, 1));
        let large = s.add(&values(4, 2));
        assert_eq!(s.type_id_of(small), Some(3));
        assert_ne!(s.type_id_of(small), Some(LARGE_ARRAY_TYPE_ID));
        assert_eq!(s.type_id_of(large), Some(LARGE_ARRAY_TYPE_ID));
        assert_eq!(s.type_id_of(EntryRef::INVALID), None);
    }

    #[test]
    fn test_small_ref_offset_is_array_index() {
        let mut s = store(3);
        let layout = s.data_store().layout();
        let first = s.add(&[1, 2]);
        let second = s.add(&[3, 4]);
        assert_eq!(layout.buffer_id(first), layout.buffer_id(second));
        assert_eq!(layout.offset(second), layout.offset(first) + 1);
        assert_eq!(s.buffer_state(second).size(), 2 * (layout.offset(second) + 1));
    }

    #[test]
    fn test_many_arrays_across_buffers() {
        let config = ArrayStoreConfig {
            growth: BufferGrowth {
                min_arrays: 4,
                max_arrays: 16,
                grow_percent: 100,
            },
            ..ArrayStoreConfig::new(2)
        };
        let mut s = ArrayStore::<u64>::new(config).unwrap();
        let arrays: Vec<Vec<u64>> = (0..200u64).map(|i| (0..i % 5).collect()).collect();
        let refs: Vec<EntryRef> = arrays.iter().map(|a| s.add(a)).collect();
        for (a, r) in arrays.iter().zip(&refs) {
            assert_eq!(s.get(*r), a.as_slice());
        }
        assert!(s.mem_stats().active_buffers > 3);
    }

    // ========================================================================
    // Remove and memory accounting
    // ========================================================================

    #[test]
    fn test_large_array_heap_bytes_accounted() {
        let mut s = ArrayStore::<u64>::new(ArrayStoreConfig::new(2)).unwrap();
        let before = s.memory_usage();
        let r = s.add(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let after_add = s.memory_usage();
        let entry = mem::size_of::<LargeArrayEntry>();
        assert_eq!(after_add.used_bytes - before.used_bytes, 2 * entry + 80);

        s.remove(r);
        let held = s.memory_usage();
        assert_eq!(held.allocated_bytes_on_hold, entry + 80);
        assert_eq!(s.get(r), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        s.transfer_hold_lists(1);
        s.trim_hold_lists(2);
        let trimmed = s.memory_usage();
        assert_eq!(trimmed.allocated_bytes_on_hold, 0);
        assert_eq!(trimmed.dead_bytes, 2 * entry);
        assert_eq!(trimmed.used_bytes, 2 * entry);
    }

    #[test]
    fn test_removed_small_array_held_until_trim() {
        let mut s = store(4);
        let r = s.add(&[5, 6, 7]);
        s.remove(r);
        assert_eq!(s.buffer_state(r).hold_elems(), 3);
        s.transfer_hold_lists(4);
        s.trim_hold_lists(4);
        assert_eq!(s.buffer_state(r).hold_elems(), 3);
        assert_eq!(s.get(r), &[5, 6, 7]);
        s.trim_hold_lists(5);
        assert_eq!(s.buffer_state(r).hold_elems(), 0);
        // Reserved array plus the removed one
        assert_eq!(s.buffer_state(r).dead_elems(), 6);
    }

    #[test]
    fn test_free_lists_reuse_large_slots() {
        let config = ArrayStoreConfig {
            enable_free_lists: true,
            ..ArrayStoreConfig::new(1)
        };
        let mut s = ArrayStore::<u32>::new(config).unwrap();
        let r1 = s.add(&[1, 2, 3]);
        s.remove(r1);
        s.transfer_hold_lists(0);
        s.trim_hold_lists(1);
        let r2 = s.add(&[4, 5]);
        assert_eq!(r2, r1);
        assert_eq!(s.get(r2), &[4, 5]);
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    #[test]
    fn test_compaction_moves_live_arrays() {
        let mut s = store(3);
        let mut refs: Vec<EntryRef> = (0..100).map(|i| s.add(&values(2, i))).collect();
        let old_buffer = s.data_store().layout().buffer_id(refs[0]);
        for r in refs.iter_mut().skip(10) {
            s.remove(*r);
            *r = EntryRef::INVALID;
        }
        s.transfer_hold_lists(1);
        s.trim_hold_lists(2);
        let dead_before = s.memory_usage().dead_bytes;

        let mut context = s.compact_worst(true, false).unwrap();
        assert_eq!(context.buffer_ids(), &[old_buffer]);
        assert!(context.needs_move(refs[0]));
        assert!(!context.needs_move(EntryRef::INVALID));
        context.compact(&mut refs);
        drop(context);

        let layout = s.data_store().layout();
        for (i, r) in refs.iter().enumerate().take(10) {
            assert_ne!(layout.buffer_id(*r), old_buffer);
            assert_eq!(s.get(*r), values(2, i as u32).as_slice());
        }
        assert!(refs[10..].iter().all(|r| !r.is_valid()));
        assert!(s.data_store().buffer_state(old_buffer).is_on_hold());

        s.transfer_hold_lists(2);
        s.trim_hold_lists(3);
        assert!(s.data_store().buffer_state(old_buffer).is_free());
        assert!(s.memory_usage().dead_bytes < dead_before);
    }

    #[test]
    fn test_compaction_moves_large_arrays() {
        let mut s = store(1);
        let keep = s.add(&values(5, 9));
        let gone = s.add(&values(6, 3));
        s.remove(gone);
        s.transfer_hold_lists(1);
        s.trim_hold_lists(2);

        let mut context = s.compact_worst(true, false).unwrap();
        let moved = context.compact_ref(keep);
        drop(context);
        assert_ne!(moved, keep);
        assert_eq!(s.get(moved), values(5, 9).as_slice());
        s.transfer_hold_lists(2);
        s.trim_hold_lists(3);
        assert_eq!(s.get(moved), values(5, 9).as_slice());
    }

    #[test]
    fn test_nothing_to_compact() {
        let mut s = store(3);
        s.add(&[1]);
        assert!(s.compact_worst(true, true).is_none());
    }

    // ========================================================================
    // Readers
    // ========================================================================

    #[test]
    fn test_reader_sees_published_arrays() {
        let mut s = store(3);
        let reader = s.reader();
        let small = s.add(&[1, 2]);
        let large = s.add(&values(7, 4));
        unsafe {
            assert_eq!(reader.get(small), &[1, 2]);
            assert_eq!(reader.get(large), values(7, 4).as_slice());
            assert!(reader.get(EntryRef::INVALID).is_empty());
        }
    }

    #[test]
    fn test_random_churn_keeps_live_arrays() {
        use rand::{Rng, SeedableRng};

        let config = ArrayStoreConfig {
            enable_free_lists: true,
            growth: BufferGrowth {
                min_arrays: 16,
                max_arrays: 256,
                grow_percent: 50,
            },
            ..ArrayStoreConfig::new(4)
        };
        let mut s = ArrayStore::<u64>::new(config).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut live: Vec<(EntryRef, Vec<u64>)> = Vec::new();

        for generation in 0..200u64 {
            for _ in 0..20 {
                if !live.is_empty() && rng.gen_bool(0.4) {
                    let (r, _) = live.swap_remove(rng.gen_range(0..live.len()));
                    s.remove(r);
                } else {
                    let len = rng.gen_range(1..12);
                    let values: Vec<u64> = (0..len).map(|_| rng.gen()).collect();
                    live.push((s.add(&values), values));
                }
            }
            s.transfer_hold_lists(generation);
            s.trim_hold_lists(generation + 1);
            if generation % 25 == 24 {
                if let Some(mut context) = s.compact_worst(true, true) {
                    for (r, _) in live.iter_mut() {
                        *r = context.compact_ref(*r);
                    }
                }
            }
        }
        for (r, values) in &live {
            assert_eq!(s.get(*r), values.as_slice());
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(arrays in proptest::collection::vec(
            proptest::collection::vec(any::<u32>(), 0..=9), 1..50)) {
            let mut s = store(3);
            let refs: Vec<EntryRef> = arrays.iter().map(|a| s.add(a)).collect();
            for (a, r) in arrays.iter().zip(&refs) {
                prop_assert_eq!(s.get(*r), a.as_slice());
                prop_assert_eq!(r.is_valid(), !a.is_empty());
            }
        }
    }
}
