//! Pages emptied by removals come back through the reuse list: refilling a
//! structure with different row sizes must not grow page memory.

use std::sync::Arc;
use std::time::Duration;

use super::helpers::{payload, u64_tree};
use crate::cache::CacheKey;
use crate::metrics::CounterIoStats;
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::page::MIN_PAGE_SIZE;
use crate::storage::{FreeList, PageMemory, ReuseList};
use crate::testing::{test_config, test_engine};

#[test]
fn test_reinsert_with_other_sizes_reuses_pages() {
    let stats = CounterIoStats::new();
    let memory = PageMemory::new(MIN_PAGE_SIZE, 1_024, Arc::clone(&stats) as _);
    let reuse = ReuseList::new(Arc::clone(&memory), 0);
    let list = FreeList::new(
        "reuse",
        Arc::clone(&reuse),
        Arc::new(CheckpointLock::default()),
    );

    // Rows too large to share a page.
    let links: Vec<_> = (0..50)
        .map(|i| list.insert_bytes(&payload(i, 700)).expect("insert"))
        .collect();
    let peak = memory.allocated_pages();
    assert_eq!(peak, 50);

    for link in links {
        list.remove_by_link(link).expect("remove");
    }
    assert_eq!(reuse.len(), peak);

    // Smaller rows pack several to a page and only take parked pages.
    let small: Vec<_> = (0..50)
        .map(|i| list.insert_bytes(&payload(100 + i, 300)).expect("insert small"))
        .collect();
    assert_eq!(memory.allocated_pages(), peak);
    assert!(reuse.len() < peak);
    assert!(stats.snapshot().pages_reused > 0);

    // Rows spanning pages also draw from the reuse list first.
    let large = list
        .insert_bytes(&payload(999, MIN_PAGE_SIZE * 3))
        .expect("insert large");
    assert_eq!(memory.allocated_pages(), peak);
    assert_eq!(list.read_payload(large).expect("read"), payload(999, MIN_PAGE_SIZE * 3));

    for link in small {
        assert_eq!(list.read_payload(link).expect("read small").len(), 300);
    }
}

#[test]
fn test_tree_and_rows_share_reuse_list() {
    let memory = PageMemory::new(MIN_PAGE_SIZE, 1_024, CounterIoStats::new());
    let reuse = ReuseList::new(Arc::clone(&memory), 0);
    let tree = u64_tree(&reuse, 1);
    for i in 0..2_000 {
        tree.put(i).expect("put");
    }
    for i in 0..2_000 {
        assert!(tree.removex(&i).expect("remove"));
    }
    let parked = reuse.len();
    assert!(parked > 0, "merges should park leaves");
    let allocated = memory.allocated_pages();

    // The free list consumes pages the tree gave up.
    let list = FreeList::new(
        "rows",
        Arc::clone(&reuse),
        Arc::new(CheckpointLock::default()),
    );
    for i in 0..parked {
        list.insert_bytes(&payload(i, 700)).expect("insert");
    }
    assert!(reuse.is_empty());
    assert_eq!(memory.allocated_pages(), allocated);
}

#[test]
fn test_engine_churn_stays_bounded() {
    let (engine, clock) = test_engine(test_config().with_tombstone_ttl(Duration::ZERO));
    let keys: Vec<_> = (0..300).map(|i| CacheKey::new(format!("churn-{i}"))).collect();

    let mut first_peak = None;
    for round in 0..8u64 {
        for (i, key) in keys.iter().enumerate() {
            // Sizes shift every round so rows never fit their old slots exactly.
            let len = 32 + (i * 7 + round as usize * 101) % 600;
            let ttl = (i % 3 == 0).then_some(Duration::from_millis(10));
            engine.put(2, key, payload(round, len), ttl).expect("put");
        }
        // Packing varies with the order pages come back, so later rounds may
        // need a few more pages than the first, but never a round's worth.
        let peak = engine.memory().allocated_pages();
        let first = *first_peak.get_or_insert(peak);
        assert!(
            peak <= first + first / 4,
            "round {round}: {peak} pages allocated, first round needed {first}"
        );

        clock.advance(10);
        for key in &keys {
            engine.remove(2, key).expect("remove");
        }
        assert_eq!(engine.size(), 0);
        for store in engine.partitions() {
            assert!(store.pending_tree().is_empty());
            assert_eq!(store.free_list().live_rows(), 0);
        }
    }
}
