//! Data store: typed buffer pool with generation-deferred reclamation
//!
//! The data store owns every buffer, the per-type allocation targets, and
//! the hold lists that keep removed entries and dead buffers alive until
//! readers have drained.
//!
//! # Design
//!
//! - Allocation bumps the `size` of the target buffer of a type. When the
//!   target is full a free buffer id is activated and becomes the new
//!   target; the old one stays in service for reads.
//! - Buffer 0 writes off its first array on activation, so the all-zero
//!   reference is never produced for a stored entry.
//! - Removal never touches memory directly. Element holds and buffer holds
//!   enter a pending list, get stamped with a generation on
//!   `transfer_hold_lists`, and are released by `trim_hold_lists` once the
//!   first used generation has passed the stamp.
//! - Resource exhaustion (no free buffer id, request larger than a buffer)
//!   is fatal and panics after logging.
//!
//! # Thread Safety
//!
//! All methods take `&mut self` and belong to the single writer. Readers go
//! through the shared [`BufferTable`] instead.

use crate::buffer_state::{BufferAlloc, BufferState, BufferStatus, BufferTable};
use crate::buffer_type::BufferType;
use attrstore_concurrency::HoldList;
use attrstore_core::{AddressSpace, EntryRef, Error, Generation, MemoryUsage, RefLayout, Result};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Location of a fresh allocation
#[derive(Debug, Clone, Copy)]
pub struct RawAlloc {
    /// Buffer the elements were allocated in
    pub buffer_id: u32,
    /// Element offset of the first allocated element
    pub elem_offset: usize,
    /// Address of the first allocated element
    pub data: *mut u8,
}

/// Element range removed by the writer
#[derive(Debug, Clone, Copy)]
struct ElemHold {
    buffer_id: u32,
    elem_offset: usize,
    elems: usize,
    extra_bytes: usize,
}

/// A released fixed-size slot available for reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeSlot {
    buffer_id: u32,
    elem_offset: usize,
}

/// Element, byte and buffer counts across the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Elements allocated in non-free buffers
    pub alloc_elems: usize,
    /// Elements written
    pub used_elems: usize,
    /// Elements dead
    pub dead_elems: usize,
    /// Elements waiting for readers to drain
    pub hold_elems: usize,
    /// Bytes allocated, including heap bytes of large arrays
    pub alloc_bytes: usize,
    /// Bytes written, including heap bytes of large arrays
    pub used_bytes: usize,
    /// Bytes dead
    pub dead_bytes: usize,
    /// Bytes waiting for readers to drain
    pub hold_bytes: usize,
    /// Buffers with no memory
    pub free_buffers: u32,
    /// Buffers in service, compacting ones included
    pub active_buffers: u32,
    /// Buffers on hold
    pub hold_buffers: u32,
}

/// Typed buffer pool
pub struct DataStore {
    layout: RefLayout,
    table: Arc<BufferTable>,
    states: Vec<BufferState>,
    types: Vec<BufferType>,
    type_ids: FxHashMap<BufferType, u32>,
    /// Allocation target per type id
    active_buffer_ids: Vec<Option<u32>>,
    /// Where the next scan for a free buffer id starts
    next_buffer_id: u32,
    elem_holds: HoldList<ElemHold>,
    buffer_holds: HoldList<u32>,
    /// Released slots per type id
    free_lists: Vec<Vec<FreeSlot>>,
    free_lists_enabled: bool,
    initializing: bool,
}

impl DataStore {
    /// Create an empty store addressing entries with `layout`
    pub fn new(layout: RefLayout) -> Result<Self> {
        layout.validate()?;
        if layout.align_bits != 0 {
            return Err(Error::UnsupportedAlignment {
                align_bits: layout.align_bits,
            });
        }
        let num_buffers = layout.num_buffers();
        Ok(DataStore {
            layout,
            table: Arc::new(BufferTable::new(num_buffers)),
            states: (0..num_buffers).map(|_| BufferState::new()).collect(),
            types: Vec::new(),
            type_ids: FxHashMap::default(),
            active_buffer_ids: Vec::new(),
            next_buffer_id: 0,
            elem_holds: HoldList::new(),
            buffer_holds: HoldList::new(),
            free_lists: Vec::new(),
            free_lists_enabled: false,
            initializing: false,
        })
    }

    /// Reference layout
    pub fn layout(&self) -> RefLayout {
        self.layout
    }

    /// Reader-visible buffer table
    pub fn table(&self) -> &Arc<BufferTable> {
        &self.table
    }

    /// Number of buffer ids
    pub fn num_buffers(&self) -> u32 {
        self.states.len() as u32
    }

    // ========================================================================
    // Types and allocation
    // ========================================================================

    /// Register a buffer type, returning its type id
    ///
    /// Registering an equal descriptor again returns the existing id.
    pub fn add_type(&mut self, buffer_type: BufferType) -> u32 {
        if let Some(&type_id) = self.type_ids.get(&buffer_type) {
            return type_id;
        }
        let type_id = self.types.len() as u32;
        self.types.push(buffer_type);
        self.type_ids.insert(buffer_type, type_id);
        self.active_buffer_ids.push(None);
        self.free_lists.push(Vec::new());
        type_id
    }

    /// Descriptor registered under `type_id`
    pub fn buffer_type(&self, type_id: u32) -> &BufferType {
        &self.types[type_id as usize]
    }

    /// Number of registered types
    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    /// Current allocation target of `type_id`
    pub fn active_buffer_id(&self, type_id: u32) -> Option<u32> {
        self.active_buffer_ids[type_id as usize]
    }

    /// Make sure the target buffer of `type_id` has room for `elems` elements
    ///
    /// Switches to a new buffer when it does not. Returns the target buffer.
    pub fn ensure_buffer_capacity(&mut self, type_id: u32, elems: usize) -> u32 {
        if let Some(buffer_id) = self.active_buffer_ids[type_id as usize] {
            if self.states[buffer_id as usize].remaining() >= elems {
                return buffer_id;
            }
        }
        self.switch_active_buffer(type_id, elems)
    }

    /// Activate a free buffer as the new target of `type_id`
    ///
    /// The previous target stays in service for reads.
    ///
    /// # Panics
    ///
    /// Panics if no buffer id is free or `elems` exceeds what one buffer
    /// can address.
    pub fn switch_active_buffer(&mut self, type_id: u32, elems: usize) -> u32 {
        let buffer_type = self.types[type_id as usize];
        let used_elems: usize = self
            .states
            .iter()
            .filter(|state| state.type_id() == Some(type_id))
            .filter(|state| state.is_active() || state.is_compacting())
            .map(|state| state.size() - state.dead_elems())
            .sum();

        let buffer_id = match self.find_free_buffer() {
            Some(buffer_id) => buffer_id,
            None => fatal(Error::BuffersExhausted {
                num_buffers: self.num_buffers(),
            }),
        };
        let reserved = if buffer_id == 0 {
            buffer_type.array_size()
        } else {
            0
        };
        let offset_size = self.layout.offset_size();
        let capacity =
            match buffer_type.elems_to_alloc(used_elems, elems + reserved, offset_size) {
                Some(capacity) => capacity,
                None => fatal(Error::CapacityExceeded {
                    resource: "buffer elements",
                    requested: elems + reserved,
                    limit: offset_size.saturating_mul(buffer_type.array_size()),
                }),
            };
        let layout = match buffer_type.buffer_layout(capacity) {
            Some(layout) => layout,
            None => fatal(Error::CapacityExceeded {
                resource: "buffer bytes",
                requested: capacity,
                limit: isize::MAX as usize / buffer_type.elem_size().max(1),
            }),
        };

        let alloc = BufferAlloc::zeroed(layout);
        let data = alloc.as_ptr();
        let state = &mut self.states[buffer_id as usize];
        state.activate(type_id, buffer_type, capacity, alloc);
        if reserved > 0 {
            state.reserve_elems(reserved);
        }
        self.table.publish(buffer_id, data, type_id);
        self.active_buffer_ids[type_id as usize] = Some(buffer_id);
        self.next_buffer_id = (buffer_id + 1) % self.num_buffers();
        debug!(buffer_id, type_id, capacity, used_elems, "activated buffer");
        buffer_id
    }

    fn find_free_buffer(&self) -> Option<u32> {
        let num_buffers = self.num_buffers();
        (0..num_buffers)
            .map(|i| (self.next_buffer_id + i) % num_buffers)
            .find(|&buffer_id| self.states[buffer_id as usize].is_free())
    }

    /// Allocate `elems` contiguous elements of `type_id`
    ///
    /// A released slot is reused when free lists are enabled and the request
    /// is exactly one array. The memory is zeroed or holds a released entry;
    /// the caller initializes it before handing out a reference.
    pub fn alloc(&mut self, type_id: u32, elems: usize) -> RawAlloc {
        let buffer_type = self.types[type_id as usize];
        if self.free_lists_enabled && elems == buffer_type.array_size() {
            if let Some(slot) = self.free_lists[type_id as usize].pop() {
                let state = &mut self.states[slot.buffer_id as usize];
                state.reuse_dead_elems(elems);
                return RawAlloc {
                    buffer_id: slot.buffer_id,
                    elem_offset: slot.elem_offset,
                    data: self.entry_ptr(slot.buffer_id, slot.elem_offset),
                };
            }
        }
        let buffer_id = self.ensure_buffer_capacity(type_id, elems);
        let state = &mut self.states[buffer_id as usize];
        let elem_offset = state.size();
        state.push_back(elems);
        RawAlloc {
            buffer_id,
            elem_offset,
            data: self.entry_ptr(buffer_id, elem_offset),
        }
    }

    /// Account heap bytes owned by entries of `buffer_id`
    pub fn inc_extra_used_bytes(&mut self, buffer_id: u32, bytes: usize) {
        self.states[buffer_id as usize].inc_extra_used_bytes(bytes);
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Encode the reference of the array starting at `elem_offset`
    pub fn make_ref(&self, buffer_id: u32, elem_offset: usize) -> EntryRef {
        let array_size = self.state_type(buffer_id).array_size();
        debug_assert_eq!(elem_offset % array_size, 0);
        self.layout.make(elem_offset / array_size, buffer_id)
    }

    /// Decode a reference into `(buffer_id, elem_offset)`
    ///
    /// # Panics
    ///
    /// Panics if the reference points into a free buffer.
    pub fn resolve(&self, r: EntryRef) -> (u32, usize) {
        let buffer_id = self.layout.buffer_id(r);
        let array_size = self.state_type(buffer_id).array_size();
        (buffer_id, self.layout.offset(r) * array_size)
    }

    /// Address of element `elem_offset` in `buffer_id`
    ///
    /// # Panics
    ///
    /// Panics if the buffer is free or the offset is past its capacity.
    pub fn entry_ptr(&self, buffer_id: u32, elem_offset: usize) -> *mut u8 {
        let state = &self.states[buffer_id as usize];
        let buffer_type = self.state_type(buffer_id);
        assert!(
            elem_offset <= state.capacity(),
            "offset {} past capacity {} of buffer {}",
            elem_offset,
            state.capacity(),
            buffer_id
        );
        // SAFETY: the offset is within the allocation
        unsafe { state.data().add(elem_offset * buffer_type.elem_size()) }
    }

    /// State of `buffer_id`
    pub fn buffer_state(&self, buffer_id: u32) -> &BufferState {
        &self.states[buffer_id as usize]
    }

    /// Type id of the entries in `buffer_id`, if the buffer is not free
    pub fn type_id_of(&self, buffer_id: u32) -> Option<u32> {
        self.states[buffer_id as usize].type_id()
    }

    fn state_type(&self, buffer_id: u32) -> &BufferType {
        match self.states[buffer_id as usize].buffer_type() {
            Some(buffer_type) => buffer_type,
            None => panic!("reference into free buffer {}", buffer_id),
        }
    }

    // ========================================================================
    // Holds
    // ========================================================================

    /// Remove `elems` elements starting at the array `r`
    ///
    /// The elements stay readable until the hold is trimmed. In a compacting
    /// buffer they are written off immediately since the whole buffer will
    /// be held. In initializing mode they are released immediately.
    pub fn hold_elem(&mut self, r: EntryRef, elems: usize, extra_bytes: usize) {
        let (buffer_id, elem_offset) = self.resolve(r);
        let state = &mut self.states[buffer_id as usize];
        if state.elem_hold_list_disabled() {
            state.inc_dead_elems(elems);
            return;
        }
        state.inc_hold_elems(elems, extra_bytes);
        let hold = ElemHold {
            buffer_id,
            elem_offset,
            elems,
            extra_bytes,
        };
        if self.initializing {
            self.release_elem_hold(hold);
        } else {
            self.elem_holds.push(hold);
        }
    }

    /// Write off `elems` elements of the array `r` without holding them
    pub fn inc_dead(&mut self, r: EntryRef, elems: usize) {
        let buffer_id = self.layout.buffer_id(r);
        self.states[buffer_id as usize].inc_dead_elems(elems);
    }

    /// Retire a whole buffer
    ///
    /// The buffer stops being an allocation target and is freed once its
    /// hold is trimmed.
    pub fn hold_buffer(&mut self, buffer_id: u32) {
        self.states[buffer_id as usize].hold();
        for active in self.active_buffer_ids.iter_mut() {
            if *active == Some(buffer_id) {
                *active = None;
            }
        }
        self.drop_free_slots(buffer_id);
        self.buffer_holds.push(buffer_id);
    }

    /// Stamp pending holds with `generation`
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.elem_holds.transfer(generation);
        for &buffer_id in self.buffer_holds.iter() {
            self.states[buffer_id as usize].stamp_hold(generation);
        }
        self.buffer_holds.transfer(generation);
    }

    /// Release holds stamped before `first_used`
    ///
    /// Element holds are released before buffer holds.
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        let mut elem_holds = Vec::new();
        self.elem_holds
            .trim(first_used, |hold| elem_holds.push(hold));
        for hold in elem_holds {
            self.release_elem_hold(hold);
        }

        let mut buffer_ids = Vec::new();
        self.buffer_holds
            .trim(first_used, |buffer_id| buffer_ids.push(buffer_id));
        for buffer_id in buffer_ids {
            self.free_buffer(buffer_id);
        }
    }

    /// Release every hold regardless of generation
    pub fn clear_hold_lists(&mut self) {
        let mut elem_holds = Vec::new();
        self.elem_holds.clear(|hold| elem_holds.push(hold));
        for hold in elem_holds {
            self.release_elem_hold(hold);
        }

        let mut buffer_ids = Vec::new();
        self.buffer_holds.clear(|buffer_id| buffer_ids.push(buffer_id));
        for buffer_id in buffer_ids {
            self.free_buffer(buffer_id);
        }
    }

    /// Check if element holds wait for a generation stamp
    pub fn has_pending_elem_holds(&self) -> bool {
        self.elem_holds.pending_len() > 0
    }

    fn release_elem_hold(&mut self, hold: ElemHold) {
        let free_lists_enabled = self.free_lists_enabled;
        let state = &mut self.states[hold.buffer_id as usize];
        state.release_hold_elems(hold.elems, hold.extra_bytes);
        let buffer_type = match state.buffer_type() {
            Some(buffer_type) => *buffer_type,
            None => return,
        };
        // SAFETY: the range was written before the hold, and the hold
        // generation has drained
        unsafe {
            let data = state
                .data()
                .add(hold.elem_offset * buffer_type.elem_size());
            buffer_type.clean(data, hold.elems);
        }
        if free_lists_enabled && state.is_active() && hold.elems == buffer_type.array_size() {
            if let Some(type_id) = state.type_id() {
                self.free_lists[type_id as usize].push(FreeSlot {
                    buffer_id: hold.buffer_id,
                    elem_offset: hold.elem_offset,
                });
            }
        }
    }

    fn free_buffer(&mut self, buffer_id: u32) {
        self.table.retract(buffer_id);
        if let Some((buffer_type, alloc, size)) = self.states[buffer_id as usize].free() {
            // SAFETY: readers have drained and the buffer is unreachable
            unsafe { buffer_type.clean(alloc.as_ptr(), size) };
        }
        debug!(buffer_id, "freed buffer");
    }

    fn drop_free_slots(&mut self, buffer_id: u32) {
        for free_list in self.free_lists.iter_mut() {
            free_list.retain(|slot| slot.buffer_id != buffer_id);
        }
    }

    // ========================================================================
    // Modes
    // ========================================================================

    /// Recycle released fixed-size slots for later allocations
    pub fn enable_free_lists(&mut self) {
        self.free_lists_enabled = true;
    }

    /// Write off removed elements in every non-free buffer directly
    pub fn disable_elem_hold_list(&mut self) {
        for state in self.states.iter_mut().filter(|state| !state.is_free()) {
            state.disable_elem_hold_list();
        }
    }

    /// Release removed elements immediately while no readers exist
    pub fn set_initializing(&mut self, initializing: bool) {
        self.initializing = initializing;
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Element, byte and buffer counts
    pub fn mem_stats(&self) -> MemStats {
        let mut stats = MemStats::default();
        for state in &self.states {
            let elem_size = state.buffer_type().map_or(0, BufferType::elem_size);
            let held_elems = match state.status() {
                BufferStatus::Free => {
                    stats.free_buffers += 1;
                    continue;
                }
                BufferStatus::Active | BufferStatus::Compacting => {
                    stats.active_buffers += 1;
                    state.hold_elems()
                }
                BufferStatus::Hold { .. } => {
                    stats.hold_buffers += 1;
                    state.size() - state.dead_elems()
                }
            };
            stats.alloc_elems += state.capacity();
            stats.used_elems += state.size();
            stats.dead_elems += state.dead_elems();
            stats.hold_elems += held_elems;
            stats.alloc_bytes += state.allocated_bytes() + state.extra_used_bytes();
            stats.used_bytes += state.size() * elem_size + state.extra_used_bytes();
            stats.dead_bytes += state.dead_elems() * elem_size;
            stats.hold_bytes += held_elems * elem_size + state.extra_hold_bytes();
        }
        stats
    }

    /// Byte statistics
    pub fn memory_usage(&self) -> MemoryUsage {
        let stats = self.mem_stats();
        MemoryUsage::new(
            stats.alloc_bytes,
            stats.used_bytes,
            stats.dead_bytes,
            stats.hold_bytes,
        )
    }

    /// Array statistics
    ///
    /// Free buffer ids count toward the limit with a maximal buffer each.
    pub fn address_space_usage(&self) -> AddressSpace {
        let max_arrays = self.layout.offset_size();
        let mut space = AddressSpace::default();
        for state in &self.states {
            let array_size = state.buffer_type().map_or(1, BufferType::array_size);
            match state.status() {
                BufferStatus::Free => space.limit += max_arrays,
                BufferStatus::Active | BufferStatus::Compacting => {
                    space.used += state.size() / array_size;
                    space.dead += state.dead_elems() / array_size;
                    space.limit += state.capacity() / array_size;
                }
                BufferStatus::Hold { .. } => {
                    space.used += state.size() / array_size;
                    space.limit += state.capacity() / array_size;
                }
            }
        }
        space
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Pick the worst buffers and mark them compacting
    ///
    /// The worst buffer by dead elements is picked when `compact_memory` is
    /// set, and the worst by dead arrays when `compact_address_space` is
    /// set. Reserved elements are not counted. A picked buffer that is the
    /// allocation target of its type is replaced by a fresh buffer first.
    pub fn start_compact_worst_buffers(
        &mut self,
        compact_memory: bool,
        compact_address_space: bool,
    ) -> SmallVec<[u32; 2]> {
        let mut worst_memory: Option<(u32, usize)> = None;
        let mut worst_address_space: Option<(u32, usize)> = None;
        for (buffer_id, state) in self.states.iter().enumerate() {
            if !state.is_active() {
                continue;
            }
            let array_size = state.buffer_type().map_or(1, BufferType::array_size);
            let dead_elems = state.dead_elems() - state.reserved_elems();
            if compact_memory && dead_elems > worst_memory.map_or(0, |(_, dead)| dead) {
                worst_memory = Some((buffer_id as u32, dead_elems));
            }
            let dead_arrays = dead_elems / array_size;
            if compact_address_space
                && dead_arrays > worst_address_space.map_or(0, |(_, dead)| dead)
            {
                worst_address_space = Some((buffer_id as u32, dead_arrays));
            }
        }

        let mut result = SmallVec::new();
        if let Some((buffer_id, dead_elems)) = worst_memory {
            info!(buffer_id, dead_elems, "compacting buffer for memory");
            self.mark_compacting(buffer_id);
            result.push(buffer_id);
        }
        if let Some((buffer_id, dead_arrays)) = worst_address_space {
            if !result.contains(&buffer_id) {
                info!(buffer_id, dead_arrays, "compacting buffer for address space");
                self.mark_compacting(buffer_id);
                result.push(buffer_id);
            }
        }
        result
    }

    fn mark_compacting(&mut self, buffer_id: u32) {
        let type_id = match self.states[buffer_id as usize].type_id() {
            Some(type_id) => type_id,
            None => panic!("cannot compact free buffer {}", buffer_id),
        };
        if self.active_buffer_ids[type_id as usize] == Some(buffer_id) {
            self.switch_active_buffer(type_id, 0);
        }
        self.states[buffer_id as usize].start_compacting();
        self.drop_free_slots(buffer_id);
    }

    /// Retire buffers whose live entries have been moved
    pub fn finish_compact(&mut self, buffer_ids: &[u32]) {
        for &buffer_id in buffer_ids {
            self.hold_buffer(buffer_id);
        }
        info!(buffers = ?buffer_ids, "finished compaction");
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        self.clear_hold_lists();
        for (buffer_id, state) in self.states.iter().enumerate() {
            self.table.retract(buffer_id as u32);
            if let Some(buffer_type) = state.buffer_type() {
                // SAFETY: the store is going away; nothing can read the buffer
                unsafe { buffer_type.clean(state.data(), state.size()) };
            }
        }
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("layout", &self.layout)
            .field("types", &self.types.len())
            .field("stats", &self.mem_stats())
            .finish()
    }
}

fn fatal(error: Error) -> ! {
    error!(%error, "data store cannot make progress");
    panic!("{}", error)
}
