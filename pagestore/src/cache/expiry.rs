//! Expiration queue: pending rows waiting for the expiry worker.
//!
//! The queue is a dispatch hint. The pending trees stay authoritative: a row
//! popped here is only applied if removing it from its pending tree succeeds,
//! so a row queued twice across fills is still expired once.
//!
//! # Invariants
//!
//! - A row is at most once in the queue at any time
//! - `len()` may lag concurrent pushes and pops but never goes negative

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::rows::PendingRow;

#[derive(Debug, Default)]
struct QueueInner {
    rows: VecDeque<PendingRow>,
    queued: HashSet<PendingRow>,
}

/// Insertion-ordered, duplicate-free queue of pending rows.
#[derive(Debug, Default)]
pub struct ExpirationQueue {
    inner: Mutex<QueueInner>,
    len: AtomicUsize,
}

impl ExpirationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `row`. Returns `false` if it is already queued.
    pub fn push(&self, row: PendingRow) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(row) {
            return false;
        }
        inner.rows.push_back(row);
        self.len.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Oldest queued row, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<PendingRow> {
        self.inner.lock().rows.front().copied()
    }

    /// Remove and return the oldest queued row.
    pub fn pop(&self) -> Option<PendingRow> {
        let mut inner = self.inner.lock();
        let row = inner.rows.pop_front()?;
        inner.queued.remove(&row);
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(row)
    }

    /// Number of queued rows. Approximate under concurrent use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the queue looks empty. Does not take the queue lock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
