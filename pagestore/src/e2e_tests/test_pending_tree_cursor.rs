//! A cursor walks the pending tree and removes every row it yields. The
//! removals merge the two leaves and recycle a page, which an unrelated free
//! list immediately takes over as a data page. The cursor must neither follow
//! the stale page nor skip or repeat rows.

use std::ops::Bound;
use std::sync::Arc;

use super::helpers::{payload, pending_row};
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::page::MIN_PAGE_SIZE;
use crate::storage::FreeList;
use crate::testing::test_partition;

const PARTITION: u16 = 3;

#[test]
fn test_cursor_survives_merge_and_page_reuse() {
    let store = test_partition(MIN_PAGE_SIZE, 4096, PARTITION);
    let tree = store.pending_tree();
    let capacity = tree.leaf_capacity();

    // One split: the left leaf keeps half, the right leaf gets the rest.
    let total = capacity + 1 + capacity / 4;
    for i in 0..total as u64 {
        tree.put(pending_row(PARTITION, 1_000 + i)).expect("put");
    }
    assert_eq!(tree.leaf_count().expect("leaf count"), 2);
    assert_eq!(tree.height(), 2);

    let unrelated = FreeList::new(
        "unrelated",
        Arc::clone(store.reuse()),
        Arc::new(CheckpointLock::default()),
    );
    let mut reused_pages = 0;
    let mut removed = 0;
    let mut last = None;

    let cursor = tree
        .find(Bound::Unbounded, Bound::Unbounded)
        .expect("open cursor");
    for row in cursor {
        let row = row.expect("cursor row");
        if let Some(last) = last {
            assert!(row > last, "cursor went backwards: {row:?} after {last:?}");
        }
        last = Some(row);

        assert!(tree.removex(&row).expect("remove"));
        removed += 1;

        if reused_pages == 0 && tree.leaf_count().expect("leaf count") == 1 {
            // The merge parked pages on the partition's reuse list; hand them
            // all to the unrelated free list.
            assert!(!store.reuse().is_empty());
            let mut seed = 0;
            while !store.reuse().is_empty() {
                seed += 1;
                unrelated
                    .insert_bytes(&payload(seed, MIN_PAGE_SIZE / 2))
                    .expect("unrelated insert");
                reused_pages += 1;
                assert!(seed < 16, "reuse list did not drain");
            }
        }
    }

    assert!(reused_pages > 0, "no leaf was merged away");
    assert_eq!(removed, total);
    assert!(tree.is_empty());
    tree.validate().expect("tree still valid");
    assert_eq!(unrelated.live_rows(), reused_pages);
}
