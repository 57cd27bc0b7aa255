//! Buffer lifecycle and the reader-visible buffer table
//!
//! Writer-side bookkeeping lives in [`BufferState`]; readers only see the
//! [`BufferTable`], which maps a buffer id to its memory and type id through
//! atomics.
//!
//! # Lifecycle
//!
//! ```text
//! Free ──activate──► Active ──start_compact──► Compacting
//!                      │                          │
//!                      └────────hold_buffer───────┴──► Hold ──trim──► Free
//! ```
//!
//! `Active` buffers are in service: readable, and writable if they are the
//! allocation target of their type. `Compacting` buffers are readable but
//! receive no new entries. `Hold` buffers are dead but may still be read by
//! guards taken before they were held.

use crate::buffer_type::BufferType;
use attrstore_core::Generation;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Lifecycle state of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// No memory, available for activation
    Free,
    /// In service
    Active,
    /// In service while its live entries are moved elsewhere
    Compacting,
    /// Dead, waiting for readers to drain
    Hold {
        /// Generation the hold was stamped with, once transferred
        since: Option<Generation>,
    },
}

/// Owned buffer memory
#[derive(Debug)]
pub(crate) struct BufferAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl BufferAlloc {
    /// Allocate zeroed memory, aborting on allocation failure
    pub(crate) fn zeroed(layout: Layout) -> Self {
        // SAFETY: buffer layouts are never zero-sized
        let raw = unsafe { alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => BufferAlloc { ptr, layout },
            None => {
                tracing::error!(bytes = layout.size(), "buffer allocation failed");
                handle_alloc_error(layout)
            }
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for BufferAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is plain memory owned by this value
unsafe impl Send for BufferAlloc {}
unsafe impl Sync for BufferAlloc {}

/// Writer-side state of one buffer
#[derive(Debug)]
pub struct BufferState {
    status: BufferStatus,
    type_id: Option<u32>,
    buffer_type: Option<BufferType>,
    capacity: usize,
    size: usize,
    dead_elems: usize,
    /// Dead elements that can never be reclaimed by compaction
    reserved_elems: usize,
    hold_elems: usize,
    extra_used_bytes: usize,
    extra_hold_bytes: usize,
    /// Removes count as dead right away instead of being held
    elem_hold_list_disabled: bool,
    alloc: Option<BufferAlloc>,
}

impl BufferState {
    pub(crate) fn new() -> Self {
        BufferState {
            status: BufferStatus::Free,
            type_id: None,
            buffer_type: None,
            capacity: 0,
            size: 0,
            dead_elems: 0,
            reserved_elems: 0,
            hold_elems: 0,
            extra_used_bytes: 0,
            extra_hold_bytes: 0,
            elem_hold_list_disabled: false,
            alloc: None,
        }
    }

    /// Lifecycle state
    pub fn status(&self) -> BufferStatus {
        self.status
    }

    /// Registered type of the entries, if the buffer is not free
    pub fn type_id(&self) -> Option<u32> {
        self.type_id
    }

    /// Elements the buffer can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements written (high-water mark)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Elements free at the end
    pub fn remaining(&self) -> usize {
        self.capacity - self.size
    }

    /// Elements that are dead
    pub fn dead_elems(&self) -> usize {
        self.dead_elems
    }

    /// Dead elements set aside at activation
    pub fn reserved_elems(&self) -> usize {
        self.reserved_elems
    }

    /// Elements removed and waiting on the element hold list
    pub fn hold_elems(&self) -> usize {
        self.hold_elems
    }

    /// Heap bytes owned by live entries
    pub fn extra_used_bytes(&self) -> usize {
        self.extra_used_bytes
    }

    /// Heap bytes owned by held entries
    pub fn extra_hold_bytes(&self) -> usize {
        self.extra_hold_bytes
    }

    /// Check if the buffer has no memory
    pub fn is_free(&self) -> bool {
        matches!(self.status, BufferStatus::Free)
    }

    /// Check if the buffer is in service and not being compacted
    pub fn is_active(&self) -> bool {
        matches!(self.status, BufferStatus::Active)
    }

    /// Check if live entries are being moved out of the buffer
    pub fn is_compacting(&self) -> bool {
        matches!(self.status, BufferStatus::Compacting)
    }

    /// Check if the buffer is dead and waiting for readers
    pub fn is_on_hold(&self) -> bool {
        matches!(self.status, BufferStatus::Hold { .. })
    }

    /// Check if readers may resolve references into this buffer
    pub fn is_readable(&self) -> bool {
        match self.status {
            BufferStatus::Free => false,
            BufferStatus::Active | BufferStatus::Compacting | BufferStatus::Hold { .. } => true,
        }
    }

    pub(crate) fn buffer_type(&self) -> Option<&BufferType> {
        self.buffer_type.as_ref()
    }

    pub(crate) fn data(&self) -> *mut u8 {
        self.alloc
            .as_ref()
            .map_or(ptr::null_mut(), BufferAlloc::as_ptr)
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.alloc.as_ref().map_or(0, BufferAlloc::bytes)
    }

    pub(crate) fn elem_hold_list_disabled(&self) -> bool {
        self.elem_hold_list_disabled
    }

    /// Free -> Active
    pub(crate) fn activate(
        &mut self,
        type_id: u32,
        buffer_type: BufferType,
        capacity: usize,
        alloc: BufferAlloc,
    ) {
        match self.status {
            BufferStatus::Free => {}
            other => panic!("cannot activate buffer in state {:?}", other),
        }
        debug_assert_eq!(self.size, 0);
        debug_assert!(self.alloc.is_none());
        self.status = BufferStatus::Active;
        self.type_id = Some(type_id);
        self.buffer_type = Some(buffer_type);
        self.capacity = capacity;
        self.elem_hold_list_disabled = false;
        self.alloc = Some(alloc);
    }

    /// Active -> Compacting
    pub(crate) fn start_compacting(&mut self) {
        match self.status {
            BufferStatus::Active => {
                self.status = BufferStatus::Compacting;
                self.elem_hold_list_disabled = true;
            }
            other => panic!("cannot compact buffer in state {:?}", other),
        }
    }

    /// Active | Compacting -> Hold
    pub(crate) fn hold(&mut self) {
        match self.status {
            BufferStatus::Active | BufferStatus::Compacting => {
                self.status = BufferStatus::Hold { since: None };
                self.extra_hold_bytes = self.extra_used_bytes;
            }
            other => panic!("cannot hold buffer in state {:?}", other),
        }
    }

    /// Stamp a pending hold with its generation
    pub(crate) fn stamp_hold(&mut self, generation: Generation) {
        match self.status {
            BufferStatus::Hold { since: None } => {
                self.status = BufferStatus::Hold {
                    since: Some(generation),
                };
            }
            BufferStatus::Hold { since: Some(_) } => {}
            other => panic!("cannot stamp hold of buffer in state {:?}", other),
        }
    }

    /// Hold -> Free, returning the memory for cleanup
    pub(crate) fn free(&mut self) -> Option<(BufferType, BufferAlloc, usize)> {
        match self.status {
            BufferStatus::Hold { .. } => {}
            other => panic!("cannot free buffer in state {:?}", other),
        }
        let size = self.size;
        let released = match (self.buffer_type.take(), self.alloc.take()) {
            (Some(buffer_type), Some(alloc)) => Some((buffer_type, alloc, size)),
            _ => None,
        };
        *self = BufferState::new();
        released
    }

    pub(crate) fn push_back(&mut self, elems: usize) {
        debug_assert!(self.size + elems <= self.capacity);
        self.size += elems;
    }

    /// Write off the first `elems` elements so offset 0 is never handed out
    pub(crate) fn reserve_elems(&mut self, elems: usize) {
        debug_assert_eq!(self.size, 0);
        self.push_back(elems);
        self.dead_elems += elems;
        self.reserved_elems = elems;
    }

    pub(crate) fn inc_dead_elems(&mut self, elems: usize) {
        self.dead_elems += elems;
        debug_assert!(self.dead_elems <= self.size);
    }

    pub(crate) fn inc_hold_elems(&mut self, elems: usize, extra_bytes: usize) {
        self.hold_elems += elems;
        self.extra_hold_bytes += extra_bytes;
    }

    /// Move held elements to dead once readers have drained
    pub(crate) fn release_hold_elems(&mut self, elems: usize, extra_bytes: usize) {
        debug_assert!(self.hold_elems >= elems);
        self.hold_elems -= elems;
        self.dead_elems += elems;
        self.extra_hold_bytes -= extra_bytes;
        self.extra_used_bytes -= extra_bytes;
    }

    pub(crate) fn inc_extra_used_bytes(&mut self, bytes: usize) {
        self.extra_used_bytes += bytes;
    }

    /// Revive dead elements taken from a free list
    pub(crate) fn reuse_dead_elems(&mut self, elems: usize) {
        debug_assert!(self.dead_elems >= elems);
        self.dead_elems -= elems;
    }

    pub(crate) fn disable_elem_hold_list(&mut self) {
        self.elem_hold_list_disabled = true;
    }
}

/// One reader-visible buffer slot
#[derive(Debug)]
struct BufferSlot {
    data: AtomicPtr<u8>,
    type_id: AtomicU32,
}

/// Buffer id to memory mapping shared with readers
///
/// The writer publishes a buffer's memory before any reference into it
/// escapes and retracts it only after the buffer's hold has been released,
/// so a reader holding a guard always finds the memory its references need.
#[derive(Debug)]
pub struct BufferTable {
    slots: Box<[BufferSlot]>,
}

impl BufferTable {
    pub(crate) fn new(num_buffers: u32) -> Self {
        let slots = (0..num_buffers)
            .map(|_| BufferSlot {
                data: AtomicPtr::new(ptr::null_mut()),
                type_id: AtomicU32::new(0),
            })
            .collect();
        BufferTable { slots }
    }

    /// Number of buffer ids
    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    /// Type id of the entries in `buffer_id`
    #[inline]
    pub fn type_id(&self, buffer_id: u32) -> u32 {
        self.slots[buffer_id as usize]
            .type_id
            .load(Ordering::Acquire)
    }

    /// Pointer to element `elem_offset` of `buffer_id`
    ///
    /// # Safety
    ///
    /// The caller must hold a generation guard covering the reference the
    /// coordinates came from, and `E` must be the buffer's element type.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has no memory, which means the reference did not
    /// come from this store or outlived its guard.
    #[inline]
    pub unsafe fn entry<E>(&self, buffer_id: u32, elem_offset: usize) -> *const E {
        let data = self.slots[buffer_id as usize].data.load(Ordering::Acquire);
        assert!(
            !data.is_null(),
            "reference into free buffer {}",
            buffer_id
        );
        (data as *const E).add(elem_offset)
    }

    pub(crate) fn publish(&self, buffer_id: u32, data: *mut u8, type_id: u32) {
        let slot = &self.slots[buffer_id as usize];
        slot.type_id.store(type_id, Ordering::Release);
        slot.data.store(data, Ordering::Release);
    }

    pub(crate) fn retract(&self, buffer_id: u32) {
        self.slots[buffer_id as usize]
            .data
            .store(ptr::null_mut(), Ordering::Release);
    }
}
