//! Page memory: the fixed-size page store consumed by the free list and trees.
//!
//! # Design
//!
//! - Every allocated page lives in a [`Frame`] holding the page bytes behind a
//!   per-page `parking_lot::RwLock` and a dirty flag
//! - Frames are keyed by the physical part of the [`PageId`] (partition and
//!   index), so a page keeps its frame when a recycled page changes flag
//! - Page indexes are handed out per partition; freed indexes are reused and
//!   carry their next generation so a recycled index never repeats one
//! - Taking the write side of a page marks it dirty for the next checkpoint
//!
//! # Invariants
//!
//! - `allocated_pages() <= max_pages()`
//! - Page index 0 is never handed out, so `PageId::NONE` is never pinnable
//! - A pinned page stays addressable until the pin is dropped, even if the
//!   page is freed in the meantime

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};
use crate::metrics::IoStatistics;
use crate::storage::page::{Page, PageFlag, PageId, PageType};

/// Default page memory capacity in pages.
pub const DEFAULT_MAX_PAGES: u64 = 262_144;

/// Shared read access to a pinned page.
pub type PageReadGuard<'a> = RwLockReadGuard<'a, Page>;

/// Exclusive write access to a pinned page.
pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, Page>;

/// In-memory slot for one allocated page.
#[derive(Debug)]
pub struct Frame {
    /// Identifier under which the page was first allocated.
    id: PageId,
    page: RwLock<Page>,
    dirty: AtomicBool,
}

/// A pin on an allocated page.
///
/// Cloning a pin is cheap. The page content is reached through [`read`] and
/// [`write`]; the latter marks the page dirty.
///
/// [`read`]: PinnedPage::read
/// [`write`]: PinnedPage::write
#[derive(Debug, Clone)]
pub struct PinnedPage {
    frame: Arc<Frame>,
}

impl PinnedPage {
    /// Identifier the frame was allocated under.
    #[must_use]
    pub fn id(&self) -> PageId {
        self.frame.id
    }

    /// Take the shared side of the page lock.
    pub fn read(&self) -> PageReadGuard<'_> {
        self.frame.page.read()
    }

    /// Take the exclusive side of the page lock and mark the page dirty.
    pub fn write(&self) -> PageWriteGuard<'_> {
        let guard = self.frame.page.write();
        self.frame.dirty.store(true, Ordering::Release);
        guard
    }

    /// Like [`write`](Self::write), giving up after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<PageWriteGuard<'_>> {
        let guard = self
            .frame
            .page
            .try_write_for(timeout)
            .ok_or(StoreError::LockTimeout {
                lock: "page write lock",
                waited: timeout,
            })?;
        self.frame.dirty.store(true, Ordering::Release);
        Ok(guard)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.frame.dirty.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct PartitionAllocator {
    /// Highest index handed out so far.
    last_index: u32,
    /// Freed indexes with the generation their next page must start at.
    released: Vec<(u32, u32)>,
}

/// Fixed-size page store.
///
/// # Pre-conditions
/// - `page_size` is a supported page size (see [`is_valid_page_size`])
/// - `max_pages` > 0
///
/// [`is_valid_page_size`]: crate::storage::page::is_valid_page_size
pub struct PageMemory {
    page_size: usize,
    max_pages: u64,
    frames: RwLock<HashMap<u64, Arc<Frame>>>,
    partitions: Mutex<HashMap<u16, PartitionAllocator>>,
    allocated: AtomicU64,
    stats: Arc<dyn IoStatistics>,
}

impl PageMemory {
    /// Create an empty page memory.
    #[must_use]
    pub fn new(page_size: usize, max_pages: u64, stats: Arc<dyn IoStatistics>) -> Arc<Self> {
        debug_assert!(crate::storage::page::is_valid_page_size(page_size));
        debug_assert!(max_pages > 0);
        Arc::new(Self {
            page_size,
            max_pages,
            frames: RwLock::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            allocated: AtomicU64::new(0),
            stats,
        })
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn max_pages(&self) -> u64 {
        self.max_pages
    }

    /// Number of pages currently allocated.
    #[must_use]
    pub fn allocated_pages(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Statistics collaborator shared with the structures built on this memory.
    #[must_use]
    pub fn stats(&self) -> &Arc<dyn IoStatistics> {
        &self.stats
    }

    /// Allocate a zeroed page in `partition`.
    ///
    /// # Post-conditions
    /// - The returned page is pinnable, typed [`PageType::Fresh`] and dirty
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] when `max_pages` pages are already allocated
    pub fn allocate(&self, partition: u16, flag: PageFlag) -> Result<PageId> {
        let mut partitions = self.partitions.lock();
        let allocated = self.allocated.load(Ordering::Acquire);
        if allocated >= self.max_pages {
            return Err(StoreError::OutOfMemory {
                allocated,
                limit: self.max_pages,
            });
        }

        let alloc = partitions.entry(partition).or_default();
        let (index, generation) = match alloc.released.pop() {
            Some(released) => released,
            None => {
                let Some(next) = alloc.last_index.checked_add(1) else {
                    return Err(StoreError::OutOfMemory {
                        allocated,
                        limit: self.max_pages,
                    });
                };
                alloc.last_index = next;
                (next, 0)
            }
        };

        let page_id = PageId::new(partition, index, flag);
        let mut page = Page::new(self.page_size);
        page.format(page_id, PageType::Fresh, 0);
        page.set_generation(generation);

        let frame = Arc::new(Frame {
            id: page_id,
            page: RwLock::new(page),
            dirty: AtomicBool::new(true),
        });
        self.frames.write().insert(page_id.effective(), frame);
        self.allocated.fetch_add(1, Ordering::AcqRel);
        drop(partitions);

        self.stats.page_allocated();
        tracing::trace!(%page_id, "allocated page");
        Ok(page_id)
    }

    /// Pin an allocated page.
    ///
    /// # Errors
    /// - [`StoreError::PageNotFound`] if the page is not allocated
    pub fn pin(&self, page_id: PageId) -> Result<PinnedPage> {
        self.frames
            .read()
            .get(&page_id.effective())
            .cloned()
            .map(|frame| PinnedPage { frame })
            .ok_or(StoreError::PageNotFound(page_id))
    }

    /// Return a page to the provider.
    ///
    /// The page index becomes available to the next [`allocate`](Self::allocate)
    /// in the same partition.
    ///
    /// # Errors
    /// - [`StoreError::PageNotFound`] if the page is not allocated
    pub fn free(&self, page_id: PageId) -> Result<()> {
        let mut partitions = self.partitions.lock();
        let frame = self
            .frames
            .write()
            .remove(&page_id.effective())
            .ok_or(StoreError::PageNotFound(page_id))?;
        let next_generation = frame.page.read().generation().wrapping_add(1);
        partitions
            .entry(page_id.partition())
            .or_default()
            .released
            .push((page_id.index(), next_generation));
        self.allocated.fetch_sub(1, Ordering::AcqRel);
        drop(partitions);

        tracing::trace!(%page_id, "freed page");
        Ok(())
    }

    /// Pins of every page written since its dirty flag was last cleared.
    #[must_use]
    pub fn dirty_pages(&self) -> Vec<PinnedPage> {
        self.frames
            .read()
            .values()
            .filter(|frame| frame.dirty.load(Ordering::Acquire))
            .map(|frame| PinnedPage {
                frame: Arc::clone(frame),
            })
            .collect()
    }

    /// Number of dirty pages.
    #[must_use]
    pub fn dirty_page_count(&self) -> usize {
        self.frames
            .read()
            .values()
            .filter(|frame| frame.dirty.load(Ordering::Acquire))
            .count()
    }
}

impl std::fmt::Debug for PageMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMemory")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("allocated", &self.allocated_pages())
            .finish_non_exhaustive()
    }
}
