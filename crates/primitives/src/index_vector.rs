//! Growable doc id -> reference array
//!
//! ## Design
//!
//! The slots live in a fixed-size array of `AtomicU32` published through an
//! `AtomicPtr`. Growing or shrinking copies the live slots into a new array,
//! publishes it, and puts the old array on a generation hold, so a reader
//! that loaded the old pointer keeps reading valid memory until its guard is
//! released.
//!
//! Slot updates are single `Release` stores; readers use `Acquire` loads and
//! therefore see the array contents a reference points at.
//!
//! ## Doc id limit
//!
//! Readers see the committed limit, not the writer's length. The writer
//! publishes it with [`IndexVector::commit_doc_id_limit`]. A lowered limit
//! keeps the previous one on a hold list, and the published array never has
//! fewer slots than any limit still on hold. A reader that captured a limit
//! under its guard can therefore index every slot below it.

use attrstore_concurrency::{GenerationHeld, GenerationHolder, HoldList};
use attrstore_core::{EntryRef, Generation, GrowStrategy, MemoryUsage};
use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct IndexArray {
    slots: Box<[AtomicU32]>,
}

impl IndexArray {
    fn zeroed(capacity: usize) -> Box<Self> {
        let slots = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Box::new(IndexArray { slots })
    }
}

impl GenerationHeld for IndexArray {
    fn byte_size(&self) -> usize {
        self.slots.len() * mem::size_of::<AtomicU32>()
    }
}

struct IndexShared {
    current: AtomicPtr<IndexArray>,
    committed: AtomicUsize,
}

impl IndexShared {
    #[inline]
    fn array(&self) -> &IndexArray {
        // SAFETY: `current` always points at a live array. Retired arrays
        // are generation held, and the last one is freed in `drop`.
        unsafe { &*self.current.load(Ordering::Acquire) }
    }
}

impl Drop for IndexShared {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        // SAFETY: the pointer came from `Box::into_raw` and is owned here
        drop(unsafe { Box::from_raw(current) });
    }
}

/// Writer side of the doc id array
pub struct IndexVector {
    shared: Arc<IndexShared>,
    holder: GenerationHolder,
    limits: HoldList<usize>,
    size: usize,
    shrink_pending: bool,
    grow: GrowStrategy,
    reallocations: u64,
}

impl IndexVector {
    /// Create an empty vector; the first push allocates per `grow`
    pub fn new(grow: GrowStrategy) -> Self {
        let array = Box::into_raw(IndexArray::zeroed(0));
        IndexVector {
            shared: Arc::new(IndexShared {
                current: AtomicPtr::new(array),
                committed: AtomicUsize::new(0),
            }),
            holder: GenerationHolder::new(),
            limits: HoldList::new(),
            size: 0,
            shrink_pending: false,
            grow,
            reallocations: 0,
        }
    }

    /// Number of slots in use
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check if no slot is in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots available before the next reallocation
    pub fn capacity(&self) -> usize {
        self.shared.array().slots.len()
    }

    /// Number of times the backing array has been replaced
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Append a slot and return its index
    ///
    /// # Panics
    ///
    /// Panics if the index would not fit a doc id.
    pub fn push(&mut self, value: EntryRef) -> u32 {
        let index = self.len();
        assert!(index < u32::MAX as usize, "doc id space exhausted");
        if index == self.capacity() {
            let capacity = self.grow.next_capacity(self.capacity()).max(index + 1);
            self.reallocate(capacity);
        }
        self.shared.array().slots[index].store(value.raw(), Ordering::Release);
        self.size = index + 1;
        index as u32
    }

    /// Reference in slot `index`
    pub fn get(&self, index: u32) -> EntryRef {
        let index = index as usize;
        assert!(index < self.len(), "doc id {} out of range", index);
        EntryRef::from_raw(self.shared.array().slots[index].load(Ordering::Relaxed))
    }

    /// Publish `value` in slot `index`
    pub fn set(&mut self, index: u32, value: EntryRef) {
        let index = index as usize;
        assert!(index < self.len(), "doc id {} out of range", index);
        self.shared.array().slots[index].store(value.raw(), Ordering::Release);
    }

    /// Make room for `capacity` slots without further reallocation
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity() {
            self.reallocate(capacity);
        }
    }

    /// Drop the slots from `limit` on
    ///
    /// Dropped slots read as invalid. Spare capacity is released by a later
    /// [`commit_doc_id_limit`](Self::commit_doc_id_limit), once no reader can
    /// hold a larger committed limit.
    pub fn shrink(&mut self, limit: usize) {
        assert!(
            limit <= self.len(),
            "cannot shrink {} slots to {}",
            self.len(),
            limit
        );
        for slot in &self.shared.array().slots[limit..self.size] {
            slot.store(EntryRef::INVALID.raw(), Ordering::Release);
        }
        self.size = limit;
        self.shrink_pending = self.capacity() > limit;
    }

    /// Publish the current length as the limit new readers see
    ///
    /// Call before [`transfer_hold_lists`](Self::transfer_hold_lists) in a
    /// commit. A lowered limit holds the previous one, and spare capacity
    /// is released down to the largest limit still on hold.
    pub fn commit_doc_id_limit(&mut self) {
        let previous = self.shared.committed.swap(self.size, Ordering::AcqRel);
        if previous > self.size {
            self.limits.push(previous);
        }
        if self.shrink_pending {
            let floor = self.limits.iter().copied().fold(self.size, usize::max);
            if floor < self.capacity() {
                self.reallocate(floor);
            }
            self.shrink_pending = self.capacity() > self.size;
        }
    }

    /// Limit published by the last commit
    pub fn committed_doc_id_limit(&self) -> usize {
        self.shared.committed.load(Ordering::Relaxed)
    }

    /// References of the first `limit` slots
    pub fn ref_copy(&self, limit: usize) -> Vec<EntryRef> {
        let limit = limit.min(self.len());
        self.shared.array().slots[..limit]
            .iter()
            .map(|slot| EntryRef::from_raw(slot.load(Ordering::Relaxed)))
            .collect()
    }

    fn reallocate(&mut self, capacity: usize) {
        let copied = self.len().min(capacity);
        let array = IndexArray::zeroed(capacity);
        for (dst, src) in array.slots.iter().zip(&self.shared.array().slots[..copied]) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let old = self
            .shared
            .current
            .swap(Box::into_raw(array), Ordering::AcqRel);
        // SAFETY: `old` came from `Box::into_raw` and is no longer published
        let old = unsafe { Box::from_raw(old) };
        self.holder.hold(old);
        self.reallocations += 1;
        debug!(capacity, copied, "reallocated index array");
    }

    /// Byte statistics, counting retired arrays as on hold
    pub fn memory_usage(&self) -> MemoryUsage {
        let slot = mem::size_of::<AtomicU32>();
        MemoryUsage::new(
            self.capacity() * slot + self.holder.held_bytes(),
            self.len() * slot,
            0,
            self.holder.held_bytes(),
        )
    }

    /// Stamp retired arrays and lowered limits with `generation`
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.holder.transfer_hold_lists(generation);
        self.limits.transfer(generation);
    }

    /// Free retired arrays and limits stamped before `first_used`
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        self.holder.trim_hold_lists(first_used);
        self.limits.trim(first_used, drop);
    }

    /// Free every retired array and limit
    pub fn clear_hold_lists(&mut self) {
        self.holder.clear_hold_lists();
        self.limits.clear(drop);
    }

    /// Reader handle sharing the published array
    pub fn reader(&self) -> IndexReader {
        IndexReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for IndexVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexVector")
            .field("len", &self.len())
            .field("committed", &self.committed_doc_id_limit())
            .field("capacity", &self.capacity())
            .field("reallocations", &self.reallocations)
            .field("holder", &self.holder)
            .finish()
    }
}

/// Reader side of the doc id array
#[derive(Clone)]
pub struct IndexReader {
    shared: Arc<IndexShared>,
}

impl IndexReader {
    /// Committed doc id limit
    pub fn len(&self) -> usize {
        self.shared.committed.load(Ordering::Acquire)
    }

    /// Check if no slot is committed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference in slot `index`
    ///
    /// # Safety
    ///
    /// The caller must hold a generation guard of the writer's handler, so
    /// the array loaded here is not freed while it is read.
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the published array. Indexes below a limit
    /// read from [`len`](Self::len) under the same guard never are.
    #[inline]
    pub unsafe fn get(&self, index: u32) -> EntryRef {
        let array = &*self.shared.current.load(Ordering::Acquire);
        match array.slots.get(index as usize) {
            Some(slot) => EntryRef::from_raw(slot.load(Ordering::Acquire)),
            None => panic!("doc id {} out of range", index),
        }
    }
}

impl std::fmt::Debug for IndexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReader").field("len", &self.len()).finish()
    }
}
