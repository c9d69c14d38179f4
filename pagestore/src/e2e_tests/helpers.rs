//! Common helpers for end-to-end tests.

use std::sync::Arc;

use crate::cache::PendingRow;
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::{BPlusTree, Link, PageFlag, PageId, ReuseList};

/// Deterministic payload of `len` bytes derived from `seed`.
#[allow(clippy::cast_possible_truncation)]
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let base = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (0..len)
        .map(|i| (base.wrapping_add(i as u64 * 31) >> 24) as u8)
        .collect()
}

/// Pending row for `partition` expiring at `expire_time`, pointing at a
/// data page that does not exist. Enough for tree-only scenarios.
#[allow(clippy::cast_possible_truncation)]
pub fn pending_row(partition: u16, expire_time: u64) -> PendingRow {
    PendingRow {
        expire_time,
        cache_id: 1,
        link: Link::new(
            PageId::new(partition, 100_000 + expire_time as u32, PageFlag::Data),
            0,
        ),
        key_hash: 0,
        tombstone: false,
    }
}

/// A `u64` tree with its own checkpoint lock over `reuse`.
pub fn u64_tree(reuse: &Arc<ReuseList>, tree_id: u32) -> BPlusTree<u64> {
    BPlusTree::create(
        format!("e2e-{tree_id}"),
        tree_id,
        Arc::clone(reuse),
        Arc::new(CheckpointLock::default()),
    )
    .expect("create tree")
}
