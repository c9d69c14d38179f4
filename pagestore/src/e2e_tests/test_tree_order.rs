//! Cursors always yield strictly increasing rows, also while other threads
//! split and merge the tree underneath them.

use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::helpers::u64_tree;
use crate::storage::ReuseList;
use crate::storage::page::MIN_PAGE_SIZE;
use crate::testing::test_memory;

fn assert_strictly_increasing(rows: &[u64]) {
    for pair in rows.windows(2) {
        assert!(pair[0] < pair[1], "{} followed by {}", pair[0], pair[1]);
    }
}

#[test]
fn test_random_inserts_come_back_sorted() {
    let reuse = ReuseList::new(test_memory(MIN_PAGE_SIZE, 4_096), 0);
    let tree = u64_tree(&reuse, 1);
    let mut rng = StdRng::seed_from_u64(7);
    let mut expected = Vec::new();
    for _ in 0..5_000 {
        let key = rng.random_range(0..1_000_000);
        if tree.put(key).expect("put").is_none() {
            expected.push(key);
        }
    }
    expected.sort_unstable();

    let rows: Vec<u64> = tree
        .find(Bound::Unbounded, Bound::Unbounded)
        .expect("cursor")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(rows, expected);
    assert_eq!(tree.size(), expected.len() as u64);
    tree.validate().expect("valid tree");
}

#[test]
fn test_cursors_stay_ordered_under_concurrent_writers() {
    let reuse = ReuseList::new(test_memory(MIN_PAGE_SIZE, 16_384), 0);
    let tree = u64_tree(&reuse, 1);
    for key in (0..4_000).step_by(2) {
        tree.put(key).expect("seed");
    }
    let done = Arc::new(AtomicBool::new(false));

    thread::scope(|scope| {
        for writer in 0..2u64 {
            let tree = &tree;
            let done = Arc::clone(&done);
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(writer);
                for _ in 0..20_000 {
                    let key = rng.random_range(0..4_000);
                    if rng.random_bool(0.5) {
                        tree.put(key).expect("put");
                    } else {
                        tree.remove(&key).expect("remove");
                    }
                }
                done.store(true, Ordering::Release);
            });
        }

        for reader in 0..2u64 {
            let tree = &tree;
            let done = Arc::clone(&done);
            scope.spawn(move || {
                let lower = reader * 1_000;
                while !done.load(Ordering::Acquire) {
                    let rows: Vec<u64> = tree
                        .find(Bound::Included(lower), Bound::Excluded(lower + 2_000))
                        .expect("cursor")
                        .collect::<Result<_, _>>()
                        .expect("rows");
                    assert_strictly_increasing(&rows);
                    assert!(rows.iter().all(|&row| (lower..lower + 2_000).contains(&row)));
                }
            });
        }
    });

    tree.validate().expect("valid tree");
}
