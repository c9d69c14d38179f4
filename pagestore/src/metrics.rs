//! I/O statistics collaborator.
//!
//! The storage core reports row and page events to an [`IoStatistics`]
//! implementation. [`NoopIoStats`] discards everything and is the default;
//! [`CounterIoStats`] keeps atomic counters for tests and the soak binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receiver of storage I/O events.
pub trait IoStatistics: Send + Sync {
    /// A row head was placed by a free list.
    fn row_inserted(&self);

    /// A row (all of its fragments) was removed.
    fn row_removed(&self);

    /// A non-head fragment was written for an oversized row.
    fn fragment_written(&self);

    /// A brand-new page was obtained from page memory.
    fn page_allocated(&self);

    /// A page was pushed onto a reuse list.
    fn page_recycled(&self);

    /// A page was taken back off a reuse list.
    fn page_reused(&self);

    /// A checkpoint pass completed, writing `pages` pages.
    fn checkpoint_completed(&self, pages: u64);
}

/// Implementation of [`IoStatistics`] that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIoStats;

impl IoStatistics for NoopIoStats {
    fn row_inserted(&self) {}
    fn row_removed(&self) {}
    fn fragment_written(&self) {}
    fn page_allocated(&self) {}
    fn page_recycled(&self) {}
    fn page_reused(&self) {}
    fn checkpoint_completed(&self, _pages: u64) {}
}

/// Thread-safe counter-based implementation of [`IoStatistics`].
#[derive(Debug, Default)]
pub struct CounterIoStats {
    pub rows_inserted: AtomicU64,
    pub rows_removed: AtomicU64,
    pub fragments_written: AtomicU64,
    pub pages_allocated: AtomicU64,
    pub pages_recycled: AtomicU64,
    pub pages_reused: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoint_pages: AtomicU64,
}

impl CounterIoStats {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            fragments_written: self.fragments_written.load(Ordering::Relaxed),
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_recycled: self.pages_recycled.load(Ordering::Relaxed),
            pages_reused: self.pages_reused.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            checkpoint_pages: self.checkpoint_pages.load(Ordering::Relaxed),
        }
    }
}

impl IoStatistics for CounterIoStats {
    fn row_inserted(&self) {
        self.rows_inserted.fetch_add(1, Ordering::Relaxed);
    }

    fn row_removed(&self) {
        self.rows_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn fragment_written(&self) {
        self.fragments_written.fetch_add(1, Ordering::Relaxed);
    }

    fn page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn page_recycled(&self) {
        self.pages_recycled.fetch_add(1, Ordering::Relaxed);
    }

    fn page_reused(&self) {
        self.pages_reused.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_completed(&self, pages: u64) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_pages.fetch_add(pages, Ordering::Relaxed);
    }
}

/// Plain copy of [`CounterIoStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub rows_inserted: u64,
    pub rows_removed: u64,
    pub fragments_written: u64,
    pub pages_allocated: u64,
    pub pages_recycled: u64,
    pub pages_reused: u64,
    pub checkpoints: u64,
    pub checkpoint_pages: u64,
}

impl IoStatsSnapshot {
    /// Rows inserted minus rows removed.
    #[must_use]
    pub const fn live_rows(&self) -> u64 {
        self.rows_inserted.saturating_sub(self.rows_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_stats() {
        let stats = CounterIoStats::new();
        stats.row_inserted();
        stats.row_inserted();
        stats.row_removed();
        stats.page_allocated();
        stats.page_recycled();
        stats.page_reused();
        stats.checkpoint_completed(12);

        let snap = stats.snapshot();
        assert_eq!(snap.live_rows(), 1);
        assert_eq!(snap.pages_allocated, 1);
        assert_eq!(snap.pages_recycled, 1);
        assert_eq!(snap.pages_reused, 1);
        assert_eq!(snap.checkpoints, 1);
        assert_eq!(snap.checkpoint_pages, 12);
    }

    #[test]
    fn test_noop_stats_accepts_events() {
        let stats: Arc<dyn IoStatistics> = Arc::new(NoopIoStats);
        stats.row_inserted();
        stats.checkpoint_completed(3);
    }
}
