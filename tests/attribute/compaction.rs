//! Compaction Tests
//!
//! Clearing a large range of docs leaves dead buffers behind; compaction
//! moves live arrays out and reclaims them on the next commit.

use crate::common::*;
use attrstore::prelude::*;

#[test]
fn compaction_reduces_dead_bytes() {
    let attr = attribute(CompactionStrategy::default());
    attr.reserve(20_000);
    for doc in 0..20_000 {
        attr.add_doc();
        attr.set(doc, &[doc, doc + 1]);
    }
    attr.commit();
    attr.clear_docs(2_000, 20_000, |_, _| {});
    attr.commit();

    let before = attr.update_stat();
    assert!(attr.consider_compact());
    attr.commit();
    let after = attr.update_stat();

    assert!(after.dead_bytes < before.dead_bytes);
    assert!(after.used_bytes <= before.used_bytes);
    for doc in 0..2_000 {
        assert_eq!(attr.get_copy(doc), vec![doc, doc + 1]);
    }
}

#[test]
fn compaction_not_warranted_is_a_no_op() {
    let attr = attribute(CompactionStrategy::default());
    for doc in 0..100 {
        attr.add_doc();
        attr.set(doc, &[doc]);
    }
    attr.commit();
    let before = attr.update_stat();
    assert!(!attr.consider_compact());
    attr.commit();
    assert_eq!(attr.update_stat(), before);
}

#[test]
fn repeated_compaction_keeps_values() {
    let attr = attribute(eager_compaction());
    for doc in 0..500 {
        attr.add_doc();
        attr.set(doc, &values_for(doc, 0));
    }
    attr.commit();
    for round in 1..20 {
        for doc in (0..500).filter(|doc| doc % 3 == round % 3) {
            attr.set(doc, &values_for(doc, round));
        }
        attr.commit();
        attr.update_stat();
        attr.consider_compact();
        attr.commit();
    }
    let read = attr.read();
    for doc in 0..500 {
        let values = read.get(doc);
        assert!(!values.is_empty());
        assert_eq!(values[0] % 1024, doc);
    }
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);
}
