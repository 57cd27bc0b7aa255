//! Generation handler and reader guards
//!
//! The writer advances a monotonically increasing generation after each
//! batch of changes. Readers pin the current generation by taking a guard.
//! The handler tracks the oldest generation still pinned, which tells the
//! writer how far it may reclaim retired memory.
//!
//! # Design
//!
//! Each generation has a hold node carrying a reference count. Nodes form a
//! singly linked list from the oldest generation that may still be pinned
//! (`first`) to the current one (`last`). Readers only touch `last` and the
//! reference count of the node they pin; they never take a lock.
//!
//! The reference count is stored doubled. Bit 0 marks a node as invalid,
//! which the writer sets (0 -> 1) once a non-current node has no readers.
//! A reader that loaded a stale `last` fails to acquire an invalid node and
//! retries. Invalid nodes are recycled for later generations but never
//! freed before the handler, so a stale pointer is always dereferenceable.
//!
//! # Thread Safety
//!
//! `take_guard` is lock-free and may be called from any thread.
//! `inc_generation` and `update_first_used_generation` serialize on an
//! internal lock; only the single writer is expected to call them.

use attrstore_core::Generation;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use tracing::trace;

const INVALID_BIT: u32 = 1;
const REF_STEP: u32 = 2;

/// Per-generation reader count
struct GenerationHold {
    /// Reader count times two; bit 0 set when the node is invalid
    ref_count: AtomicU32,
    generation: AtomicU64,
    /// Next newer generation, writer-owned
    next: AtomicPtr<GenerationHold>,
}

impl GenerationHold {
    fn new(generation: Generation) -> Self {
        GenerationHold {
            ref_count: AtomicU32::new(0),
            generation: AtomicU64::new(generation),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pin this node if it is still valid
    #[inline]
    fn try_acquire(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Relaxed);
        loop {
            if current & INVALID_BIT != 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + REF_STEP,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn release(&self) {
        self.ref_count.fetch_sub(REF_STEP, Ordering::Release);
    }

    /// Mark the node invalid if no reader holds it
    fn try_invalidate(&self) -> bool {
        self.ref_count
            .compare_exchange(0, INVALID_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Reuse an invalid node for a new generation
    ///
    /// The generation is written before the node becomes valid, so a reader
    /// that acquires it observes the new generation.
    fn revive(&self, generation: Generation) {
        self.generation.store(generation, Ordering::Relaxed);
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Release);
    }

    fn readers(&self) -> u32 {
        let raw = self.ref_count.load(Ordering::Acquire);
        if raw & INVALID_BIT != 0 {
            0
        } else {
            raw / REF_STEP
        }
    }
}

/// Writer-side bookkeeping
struct WriterState {
    /// Oldest generation that may still be pinned
    first: *mut GenerationHold,
    /// Recycled nodes
    free: Vec<*mut GenerationHold>,
    /// Every node ever allocated, freed on drop
    nodes: Vec<*mut GenerationHold>,
}

// SAFETY: the raw pointers reference nodes owned by the handler; they are
// only dereferenced while the handler is alive.
unsafe impl Send for WriterState {}

/// Tracks the current generation and the oldest generation pinned by readers
///
/// # Example
///
/// ```
/// use attrstore_concurrency::GenerationHandler;
///
/// let handler = GenerationHandler::new();
/// let guard = handler.take_guard();
/// handler.inc_generation();
/// assert_eq!(handler.current_generation(), 1);
/// assert_eq!(handler.first_used_generation(), 0);
/// drop(guard);
/// handler.update_first_used_generation();
/// assert_eq!(handler.first_used_generation(), 1);
/// ```
pub struct GenerationHandler {
    /// Node for the current generation
    last: AtomicPtr<GenerationHold>,
    generation: AtomicU64,
    first_used_generation: AtomicU64,
    writer: Mutex<WriterState>,
}

impl GenerationHandler {
    /// Create a handler at generation 0
    pub fn new() -> Self {
        let node = Box::into_raw(Box::new(GenerationHold::new(0)));
        GenerationHandler {
            last: AtomicPtr::new(node),
            generation: AtomicU64::new(0),
            first_used_generation: AtomicU64::new(0),
            writer: Mutex::new(WriterState {
                first: node,
                free: Vec::new(),
                nodes: vec![node],
            }),
        }
    }

    /// Pin the current generation
    ///
    /// Memory visible to the caller stays valid until the guard is dropped.
    pub fn take_guard(&self) -> GenerationGuard<'_> {
        loop {
            let node = self.last.load(Ordering::Acquire);
            // SAFETY: nodes live as long as the handler
            let hold = unsafe { &*node };
            if hold.try_acquire() {
                return GenerationGuard { hold };
            }
        }
    }

    /// Advance to the next generation
    ///
    /// Also refreshes the first used generation, so a writer can trim hold
    /// lists right after calling this.
    pub fn inc_generation(&self) {
        let mut state = self.writer.lock();
        let next_generation = self.generation.load(Ordering::Relaxed) + 1;
        let node = match state.free.pop() {
            Some(node) => {
                // SAFETY: recycled nodes are owned by the handler
                unsafe { &*node }.revive(next_generation);
                node
            }
            None => {
                let node = Box::into_raw(Box::new(GenerationHold::new(next_generation)));
                state.nodes.push(node);
                node
            }
        };
        let last = self.last.load(Ordering::Relaxed);
        // SAFETY: `last` is a live node owned by the handler
        unsafe { &*last }.next.store(node, Ordering::Relaxed);
        self.generation.store(next_generation, Ordering::Release);
        self.last.store(node, Ordering::Release);
        self.update_first_used_locked(&mut state);
    }

    /// Recompute the oldest generation still pinned by a reader
    pub fn update_first_used_generation(&self) {
        let mut state = self.writer.lock();
        self.update_first_used_locked(&mut state);
    }

    fn update_first_used_locked(&self, state: &mut WriterState) {
        let last = self.last.load(Ordering::Relaxed);
        while state.first != last {
            // SAFETY: nodes between first and last are live
            let first = unsafe { &*state.first };
            if !first.try_invalidate() {
                break;
            }
            let next = first.next.load(Ordering::Relaxed);
            debug_assert!(!next.is_null(), "non-current generation without successor");
            state.free.push(state.first);
            state.first = next;
        }
        // SAFETY: `first` is always a live node
        let generation = unsafe { &*state.first }.generation.load(Ordering::Relaxed);
        let previous = self
            .first_used_generation
            .swap(generation, Ordering::AcqRel);
        if generation != previous {
            trace!(
                first_used = generation,
                current = self.generation.load(Ordering::Relaxed),
                "first used generation advanced"
            );
        }
    }

    /// Current generation
    pub fn current_generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    /// Oldest generation possibly pinned by a reader, as of the last update
    pub fn first_used_generation(&self) -> Generation {
        self.first_used_generation.load(Ordering::Acquire)
    }

    /// Number of readers pinning `generation`
    pub fn generation_ref_count(&self, generation: Generation) -> u32 {
        let state = self.writer.lock();
        let mut node = state.first;
        while !node.is_null() {
            // SAFETY: the chain from first holds live nodes
            let hold = unsafe { &*node };
            if hold.generation.load(Ordering::Relaxed) == generation {
                return hold.readers();
            }
            node = hold.next.load(Ordering::Relaxed);
        }
        0
    }

    /// Number of readers across all generations
    pub fn total_ref_count(&self) -> u64 {
        let state = self.writer.lock();
        let mut total = 0u64;
        let mut node = state.first;
        while !node.is_null() {
            // SAFETY: the chain from first holds live nodes
            let hold = unsafe { &*node };
            total += hold.readers() as u64;
            node = hold.next.load(Ordering::Relaxed);
        }
        total
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("generation", &self.current_generation())
            .field("first_used_generation", &self.first_used_generation())
            .finish()
    }
}

impl Drop for GenerationHandler {
    fn drop(&mut self) {
        let state = self.writer.get_mut();
        for node in state.nodes.drain(..) {
            // SAFETY: every node was created by Box::into_raw and is freed once;
            // guards borrow the handler so none outlive it
            drop(unsafe { Box::from_raw(node) });
        }
    }
}

/// A reader's pin on one generation
///
/// While the guard lives, memory retired at or after its generation is not
/// reclaimed.
pub struct GenerationGuard<'a> {
    hold: &'a GenerationHold,
}

impl GenerationGuard<'_> {
    /// Generation this guard pins
    pub fn generation(&self) -> Generation {
        self.hold.generation.load(Ordering::Relaxed)
    }
}

impl Clone for GenerationGuard<'_> {
    fn clone(&self) -> Self {
        // The node cannot be invalidated while we hold it
        self.hold.ref_count.fetch_add(REF_STEP, Ordering::Relaxed);
        GenerationGuard { hold: self.hold }
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.hold.release();
    }
}

impl std::fmt::Debug for GenerationGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("generation", &self.generation())
            .finish()
    }
}
