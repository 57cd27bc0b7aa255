//! Generation Safety Tests
//!
//! Memory a reader can reach stays intact until its guard is dropped and a
//! later commit reclaims it.

use crate::common::*;
use attrstore::prelude::*;

// ============================================================================
// Pinned generation
// ============================================================================

#[test]
fn guard_keeps_bytes_through_mutation_and_compaction() {
    let attr = attribute(eager_compaction());
    for doc in 0..64 {
        assert_eq!(attr.add_doc(), doc);
        attr.set(doc, &values_for(doc, 0));
    }
    attr.commit();
    // Dead space for compaction to find later
    attr.clear_docs(32, 64, |_, _| {});
    attr.commit();
    attr.commit();
    assert_eq!(attr.current_generation(), 3);

    let read = attr.read();
    assert_eq!(read.generation(), 3);
    let pinned: Vec<&[u32]> = (0..32).map(|doc| read.get(doc)).collect();
    let expected: Vec<Vec<u32>> = (0..32).map(|doc| values_for(doc, 0)).collect();

    let mut compactions = 0;
    for round in 1..=4 {
        for doc in 0..32 {
            attr.set(doc, &values_for(doc, round));
        }
        attr.update_stat();
        if attr.consider_compact() {
            compactions += 1;
        }
        attr.commit();
    }
    assert_eq!(attr.current_generation(), 7);
    assert_eq!(attr.first_used_generation(), 3);
    assert!(compactions > 0);

    for (doc, (seen, want)) in pinned.iter().zip(&expected).enumerate() {
        assert_eq!(*seen, want.as_slice(), "doc {} changed under guard", doc);
    }
    assert!(attr.memory_usage().allocated_bytes_on_hold > 0);

    drop(pinned);
    drop(read);
    attr.commit();
    assert_eq!(attr.first_used_generation(), attr.current_generation());
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);

    let read = attr.read();
    for doc in 0..32 {
        assert_eq!(read.get(doc), values_for(doc, 4).as_slice());
    }
}

#[test]
fn newer_guard_does_not_hold_older_memory() {
    let attr = attribute(CompactionStrategy::default());
    let doc = attr.add_doc();
    attr.set(doc, &[1, 2, 3, 4, 5, 6]);
    attr.commit();
    attr.set(doc, &[7]);
    attr.commit();

    let read = attr.read();
    assert_eq!(read.get(doc), &[7]);
    attr.commit();
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);
}

#[test]
fn leaked_guard_stalls_reclamation() {
    let attr = attribute(CompactionStrategy::default());
    attr.set_generation_lag_warning(3);
    let doc = attr.add_doc();
    attr.set(doc, &[1]);
    attr.commit();

    let read = attr.read();
    let stalled_at = read.generation();
    for round in 0..10 {
        attr.set(doc, &[round]);
        attr.commit();
        assert_eq!(attr.first_used_generation(), stalled_at);
    }
    assert!(attr.memory_usage().allocated_bytes_on_hold > 0);
    assert_eq!(attr.reader_count(), 1);
    drop(read);
    attr.commit();
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);
}
