//! Two-stage hold list
//!
//! Retired items enter a pending stage. When the writer finishes a batch it
//! tags all pending items with the generation in effect and moves them to
//! the held stage. Held items are released once the first used generation
//! has moved past their tag.
//!
//! ```text
//! push ──► pending ──transfer(g)──► held[(g, item)] ──trim(first_used)──► release
//! ```

use attrstore_core::Generation;
use std::collections::VecDeque;

/// Items waiting for readers to drain
#[derive(Debug)]
pub struct HoldList<T> {
    pending: Vec<T>,
    held: VecDeque<(Generation, T)>,
}

impl<T> HoldList<T> {
    /// Create an empty hold list
    pub fn new() -> Self {
        HoldList {
            pending: Vec::new(),
            held: VecDeque::new(),
        }
    }

    /// Retire an item in the current batch
    pub fn push(&mut self, item: T) {
        self.pending.push(item);
    }

    /// Tag every pending item with `generation`
    ///
    /// Generations passed to successive calls must not decrease.
    pub fn transfer(&mut self, generation: Generation) {
        debug_assert!(
            self.held.back().map_or(true, |(g, _)| *g <= generation),
            "hold list generations must not decrease"
        );
        self.held
            .extend(self.pending.drain(..).map(|item| (generation, item)));
    }

    /// Release every held item tagged before `first_used`
    pub fn trim<F>(&mut self, first_used: Generation, mut release: F)
    where
        F: FnMut(T),
    {
        while let Some((generation, _)) = self.held.front() {
            if *generation >= first_used {
                break;
            }
            if let Some((_, item)) = self.held.pop_front() {
                release(item);
            }
        }
    }

    /// Release everything, pending and held
    pub fn clear<F>(&mut self, mut release: F)
    where
        F: FnMut(T),
    {
        for (_, item) in self.held.drain(..) {
            release(item);
        }
        for item in self.pending.drain(..) {
            release(item);
        }
    }

    /// Items not yet tagged
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Items tagged and waiting for readers
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Check if nothing is on hold
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.held.is_empty()
    }

    /// Iterate over every item on hold
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.held.iter().map(|(_, item)| item).chain(self.pending.iter())
    }
}

impl<T> Default for HoldList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_items_released_after_first_used_passes() {
        let mut list = HoldList::new();
        list.push(1);
        list.push(2);
        list.transfer(5);
        list.push(3);
        list.transfer(6);

        let mut released = Vec::new();
        list.trim(5, |i| released.push(i));
        assert!(released.is_empty());

        list.trim(6, |i| released.push(i));
        assert_eq!(released, vec![1, 2]);
        assert_eq!(list.held_len(), 1);

        list.trim(7, |i| released.push(i));
        assert_eq!(released, vec![1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pending_items_not_trimmed() {
        let mut list = HoldList::new();
        list.push("a");
        let mut released = Vec::new();
        list.trim(u64::MAX, |i| released.push(i));
        assert!(released.is_empty());
        assert_eq!(list.pending_len(), 1);

        list.clear(|i| released.push(i));
        assert_eq!(released, vec!["a"]);
        assert!(list.is_empty());
    }

    proptest! {
        #[test]
        fn prop_trim_releases_exactly_older_tags(
            batches in proptest::collection::vec(0usize..4, 1..20),
            first_used in 0u64..25,
        ) {
            let mut list = HoldList::new();
            let mut expected = 0;
            for (generation, count) in batches.iter().enumerate() {
                for _ in 0..*count {
                    list.push(generation as u64);
                }
                list.transfer(generation as u64);
                if (generation as u64) < first_used {
                    expected += count;
                }
            }
            let mut released = 0;
            list.trim(first_used, |g| {
                assert!(g < first_used);
                released += 1;
            });
            prop_assert_eq!(released, expected);
        }
    }
}
