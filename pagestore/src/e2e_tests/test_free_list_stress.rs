//! One or eight threads grow a shared free list to a high watermark, shrink
//! it to a low watermark and repeat, with row sizes from a few bytes to several
//! pages. Every row read back must match what was written, the live-row
//! count must match the rows the threads hold, and once all rows are gone
//! every page must be parked for reuse.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::helpers::payload;
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::{FreeList, Link, ReuseList};
use crate::testing::test_memory;

const THREADS: u64 = 8;
const TOTAL_OPS: u64 = 200_000;
const HIGH_WATER: u64 = 20_000;
const LOW_WATER: u64 = 1_000;

struct Stored {
    link: Link,
    seed: u64,
    len: usize,
}

fn verify(list: &FreeList, stored: &Stored) {
    let bytes = list.read_payload(stored.link).expect("read row");
    assert_eq!(bytes.len(), stored.len, "length of {}", stored.link);
    assert!(
        bytes == payload(stored.seed, stored.len),
        "content of {}",
        stored.link
    );
}

/// Run one thread's share of the operations and return the rows it left live.
fn run_worker(
    list: &FreeList,
    growing: &AtomicBool,
    worker: u64,
    ops: u64,
    page_size: usize,
) -> Vec<Stored> {
    let mut rng = StdRng::seed_from_u64(worker);
    let mut rows: Vec<Stored> = Vec::new();

    for op in 0..ops {
        let live = list.live_rows();
        if live >= HIGH_WATER {
            growing.store(false, Ordering::Release);
        } else if live <= LOW_WATER {
            growing.store(true, Ordering::Release);
        }

        let grow = growing.load(Ordering::Acquire);
        if (grow && rng.random_bool(0.9)) || (!grow && rng.random_bool(0.1)) || rows.is_empty() {
            // Mostly small rows, some spanning several pages.
            let len = if rng.random_bool(0.9) {
                rng.random_range(0..page_size / 4)
            } else {
                rng.random_range(page_size..page_size * 2 + page_size / 2)
            };
            let seed = (worker << 32) | op;
            let link = list.insert_bytes(&payload(seed, len)).expect("insert");
            rows.push(Stored { link, seed, len });
        } else {
            let index = rng.random_range(0..rows.len());
            let stored = rows.swap_remove(index);
            verify(list, &stored);
            list.remove_by_link(stored.link).expect("remove");
        }
    }

    rows
}

fn stress(page_size: usize, threads: u64) {
    let memory = test_memory(page_size, 1 << 20);
    let reuse = ReuseList::new(Arc::clone(&memory), 0);
    let list = FreeList::new(
        "stress",
        Arc::clone(&reuse),
        Arc::new(CheckpointLock::default()),
    );
    let growing = AtomicBool::new(true);

    let remaining: Vec<Stored> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|worker| {
                let list = &list;
                let growing = &growing;
                scope.spawn(move || {
                    run_worker(list, growing, worker, TOTAL_OPS / threads, page_size)
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("worker thread"))
            .collect()
    });

    // The allocator agrees with the independent count, and no two live rows
    // share a link.
    assert_eq!(list.live_rows(), remaining.len() as u64);
    let links: HashSet<Link> = remaining.iter().map(|stored| stored.link).collect();
    assert_eq!(links.len(), remaining.len());

    for stored in &remaining {
        verify(&list, stored);
        list.remove_by_link(stored.link).expect("final remove");
    }
    assert_eq!(list.live_rows(), 0);
    assert_eq!(reuse.len(), memory.allocated_pages());
}

#[test]
fn test_free_list_single_thread_1k_pages() {
    stress(1024, 1);
}

#[test]
fn test_free_list_stress_1k_pages() {
    stress(1024, THREADS);
}

#[test]
fn test_free_list_single_thread_2k_pages() {
    stress(2048, 1);
}

#[test]
fn test_free_list_stress_2k_pages() {
    stress(2048, THREADS);
}

#[test]
fn test_free_list_single_thread_4k_pages() {
    stress(4096, 1);
}

#[test]
fn test_free_list_stress_4k_pages() {
    stress(4096, THREADS);
}

#[test]
fn test_free_list_single_thread_8k_pages() {
    stress(8192, 1);
}

#[test]
fn test_free_list_stress_8k_pages() {
    stress(8192, THREADS);
}

#[test]
fn test_free_list_single_thread_16k_pages() {
    stress(16_384, 1);
}

#[test]
fn test_free_list_stress_16k_pages() {
    stress(16_384, THREADS);
}
