//! Doc Id Lifecycle Tests

use crate::common::*;
use attrstore::prelude::*;
use proptest::prelude::*;

#[test]
fn reserve_prevents_index_reallocation() {
    let attr = attribute(CompactionStrategy::default());
    attr.reserve(10_000);
    let before = attr.reallocations();
    for expected in 0..10_000 {
        assert_eq!(attr.add_doc(), expected);
    }
    assert_eq!(attr.reallocations(), before);
    assert_eq!(attr.num_docs(), 10_000);
}

#[test]
fn shrink_then_grow_reuses_ids() {
    let attr = attribute(CompactionStrategy::default());
    for doc in 0..50 {
        attr.add_doc();
        attr.set(doc, &[doc]);
    }
    let mut cleared = Vec::new();
    attr.clear_docs(40, 50, |doc, values| {
        assert_eq!(values, &[doc]);
        cleared.push(doc);
    });
    assert_eq!(cleared, (40..50).collect::<Vec<_>>());
    attr.shrink(40);
    attr.commit();
    assert_eq!(attr.num_docs(), 40);
    assert_eq!(attr.add_doc(), 40);
    assert_eq!(attr.read().num_docs(), 40);
    attr.commit();
    assert!(attr.read().get(40).is_empty());
    assert_eq!(attr.total_values(), 40);
}

#[test]
#[should_panic(expected = "which has values")]
fn shrink_below_live_doc_panics() {
    let attr = attribute(CompactionStrategy::default());
    let doc = attr.add_doc();
    attr.set(doc, &[1]);
    attr.shrink(0);
}

#[test]
fn shrink_releases_index_capacity_after_readers_leave() {
    let attr = attribute(CompactionStrategy::default());
    attr.reserve(1_000);
    for _ in 0..1_000 {
        attr.add_doc();
    }
    attr.commit();
    let full = attr.memory_usage();

    let read = attr.read();
    attr.shrink(10);
    attr.commit();
    attr.commit();
    assert_eq!(attr.memory_usage().allocated_bytes, full.allocated_bytes);
    assert_eq!(read.num_docs(), 1_000);
    assert!(read.get(999).is_empty());

    drop(read);
    attr.commit();
    attr.commit();
    assert!(attr.memory_usage().allocated_bytes < full.allocated_bytes);
    assert_eq!(attr.read().num_docs(), 10);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn doc_ids_are_dense_and_increasing(reserve in 0usize..2_000, count in 1u32..2_000) {
        let attr = attribute(CompactionStrategy::default());
        attr.reserve(reserve);
        let before = attr.reallocations();
        for expected in 0..count {
            prop_assert_eq!(attr.add_doc(), expected);
        }
        if count as usize <= reserve {
            prop_assert_eq!(attr.reallocations(), before);
        }
    }
}
