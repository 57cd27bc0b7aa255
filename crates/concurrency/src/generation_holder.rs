//! Deferred destruction of heap objects
//!
//! Used for whole structures replaced by the writer, such as a reallocated
//! index array. The old structure stays alive until readers that may still
//! see it have released their guards.

use crate::hold_list::HoldList;
use attrstore_core::Generation;

/// An object whose destruction can be deferred
pub trait GenerationHeld: Send {
    /// Heap bytes kept alive by this object
    fn byte_size(&self) -> usize;
}

/// Holds retired objects until their generation is released
#[derive(Default)]
pub struct GenerationHolder {
    list: HoldList<Box<dyn GenerationHeld>>,
    held_bytes: usize,
}

impl GenerationHolder {
    /// Create an empty holder
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire `item`
    pub fn hold(&mut self, item: Box<dyn GenerationHeld>) {
        self.held_bytes += item.byte_size();
        self.list.push(item);
    }

    /// Tag pending items with `generation`
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.list.transfer(generation);
    }

    /// Destroy items tagged before `first_used`
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        let held_bytes = &mut self.held_bytes;
        self.list.trim(first_used, |item| {
            *held_bytes -= item.byte_size();
        });
    }

    /// Destroy everything on hold
    pub fn clear_hold_lists(&mut self) {
        self.list.clear(drop);
        self.held_bytes = 0;
    }

    /// Heap bytes kept alive by retired items
    pub fn held_bytes(&self) -> usize {
        self.held_bytes
    }
}

impl std::fmt::Debug for GenerationHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationHolder")
            .field("pending", &self.list.pending_len())
            .field("held", &self.list.held_len())
            .field("held_bytes", &self.held_bytes)
            .finish()
    }
}
