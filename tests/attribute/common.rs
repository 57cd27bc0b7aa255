//! Shared helpers for attribute tests

use attrstore::prelude::*;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route tracing output to the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Compaction thresholds that trigger on any dead entry
pub fn eager_compaction() -> CompactionStrategy {
    CompactionStrategy {
        max_dead_bytes_ratio: 0.0,
        max_dead_address_space_ratio: 0.0,
        dead_bytes_slack: 1,
        dead_clusters_slack: 1,
    }
}

/// Values whose first element encodes `doc`, with lengths spanning the
/// small and large array paths
pub fn values_for(doc: u32, round: u32) -> Vec<u32> {
    let len = ((doc + round) % 9 + 1) as usize;
    vec![round * 1024 + doc; len]
}

/// Attribute with a small inline limit so both array paths are exercised
pub fn attribute(compaction: CompactionStrategy) -> MultiValueAttribute<u32> {
    init_tracing();
    AttributeBuilder::new("test")
        .max_small_array_size(4)
        .compaction(compaction)
        .build::<u32>()
        .unwrap()
}
