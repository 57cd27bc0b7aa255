//! Concurrent Reader Tests
//!
//! Reader threads check that every array they see is complete while the
//! writer rewrites, clears, shrinks, compacts and commits.

use crate::common::*;
use attrstore::prelude::*;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const DOCS: u32 = 256;

fn assert_consistent(doc: u32, values: &[u32]) {
    if let Some(&first) = values.first() {
        assert_eq!(first % 1024, doc, "doc {} holds another doc's values", doc);
        assert!(
            values.iter().all(|&v| v == first),
            "doc {} has a torn array",
            doc
        );
    }
}

#[test]
fn readers_see_complete_arrays_during_writes() {
    let attr = attribute(eager_compaction());
    for doc in 0..DOCS {
        attr.add_doc();
        attr.set(doc, &values_for(doc, 0));
    }
    attr.commit();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let attr = attr.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut lookups = 0u64;
                while !done.load(Ordering::Acquire) {
                    let read = attr.read();
                    assert!(read.generation() <= attr.current_generation());
                    for _ in 0..64 {
                        let doc = rng.gen_range(0..DOCS);
                        assert_consistent(doc, read.get(doc));
                        lookups += 1;
                    }
                }
                lookups
            })
        })
        .collect();

    let mut rng = rand::thread_rng();
    for round in 1..300 {
        for _ in 0..32 {
            let doc = rng.gen_range(0..DOCS);
            if rng.gen_bool(0.1) {
                attr.clear_doc(doc);
            } else {
                attr.set(doc, &values_for(doc, round));
            }
        }
        attr.commit();
        if round % 10 == 0 {
            attr.update_stat();
            attr.consider_compact();
            attr.commit();
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    attr.commit();
    assert_eq!(attr.reader_count(), 0);
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);
}

#[test]
fn readers_see_index_growth() {
    let attr = attribute(CompactionStrategy::default());
    attr.add_doc();
    attr.set(0, &[0]);
    attr.commit();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let attr = attr.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut max_seen = 0;
            while !done.load(Ordering::Acquire) {
                let read = attr.read();
                let num_docs = read.num_docs() as u32;
                for doc in 0..num_docs {
                    let values = read.get(doc);
                    assert!(values.is_empty() || values == [doc, doc]);
                }
                max_seen = max_seen.max(num_docs);
            }
            max_seen
        })
    };

    for doc in 1..5_000 {
        attr.add_doc();
        attr.set(doc, &[doc; 2]);
        if doc % 100 == 0 {
            attr.commit();
        }
    }
    attr.commit();
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() >= 1);
    assert!(attr.reallocations() > 1);
}

#[test]
fn readers_survive_doc_id_shrink() {
    let attr = attribute(CompactionStrategy::default());
    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let attr = attr.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut lookups = 0u64;
                while !done.load(Ordering::Acquire) {
                    let read = attr.read();
                    for doc in 0..read.num_docs() as u32 {
                        let values = read.get(doc);
                        assert!(values.is_empty() || values == [doc, doc]);
                        lookups += 1;
                    }
                }
                lookups
            })
        })
        .collect();

    for round in 0..300u32 {
        let docs = 64 + round % 64;
        for doc in 0..docs {
            assert_eq!(attr.add_doc(), doc);
            attr.set(doc, &[doc, doc]);
        }
        attr.commit();
        attr.clear_docs(0, docs, |_, _| {});
        attr.shrink(0);
        attr.commit();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    attr.commit();
    attr.commit();
    assert_eq!(attr.num_docs(), 0);
    assert_eq!(attr.reader_count(), 0);
    assert_eq!(attr.memory_usage().allocated_bytes_on_hold, 0);
}
