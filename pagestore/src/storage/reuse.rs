//! Reuse list: a per-partition pool of emptied pages.
//!
//! Pages emptied by the free list or merged away by a tree are parked here
//! before being handed out again. The list is a stack threaded through the
//! parked pages themselves: each reuse page stores the id of the next one
//! right after the common header, so the pool costs no extra pages.
//!
//! # Invariants
//!
//! - Every page on the list is typed [`PageType::Reuse`]
//! - A page's generation is advanced when it is pushed, so anything that
//!   remembered the page (a cursor, a bucket hint) can tell it was recycled
//! - Lock order is list mutex, then page lock. Callers must not hold any page
//!   lock when calling [`recycle`](ReuseList::recycle) or [`take`](ReuseList::take)

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::storage::memory::PageMemory;
use crate::storage::page::{PageFlag, PageHeader, PageId, PageType};

const NEXT_OFFSET: usize = PageHeader::SIZE;

#[derive(Debug, Default)]
struct ReuseHead {
    head: PageId,
    len: u64,
}

/// Recycled page pool for one partition.
#[derive(Debug)]
pub struct ReuseList {
    memory: Arc<PageMemory>,
    partition: u16,
    head: Mutex<ReuseHead>,
}

impl ReuseList {
    #[must_use]
    pub fn new(memory: Arc<PageMemory>, partition: u16) -> Arc<Self> {
        Arc::new(Self {
            memory,
            partition,
            head: Mutex::new(ReuseHead::default()),
        })
    }

    #[must_use]
    pub const fn partition(&self) -> u16 {
        self.partition
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    /// Number of parked pages.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.head.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park `page_id` on the list.
    ///
    /// The page content is wiped; its generation is advanced.
    ///
    /// # Errors
    /// - [`StoreError::PageNotFound`] if the page is not allocated
    /// - [`StoreError::StructureCorruption`] if the page belongs to another
    ///   partition or is already parked
    pub fn recycle(&self, page_id: PageId) -> Result<()> {
        if page_id.partition() != self.partition {
            return Err(StoreError::corruption(
                page_id,
                format!("recycled into reuse list of partition {}", self.partition),
            ));
        }

        let mut head = self.head.lock();
        let pinned = self.memory.pin(page_id)?;
        let mut page = pinned.write();
        if page.page_type() == Some(PageType::Reuse) {
            return Err(StoreError::corruption(page_id, "page recycled twice"));
        }

        let generation = page.generation().wrapping_add(1);
        page.format(page_id, PageType::Reuse, 0);
        page.set_generation(generation);
        page.write_u64(NEXT_OFFSET, head.head.as_raw());
        drop(page);

        head.head = page_id;
        head.len += 1;
        drop(head);

        self.memory.stats().page_recycled();
        tracing::trace!(%page_id, generation, "page recycled");
        Ok(())
    }

    /// Pop a parked page, if any.
    ///
    /// The returned page keeps its [`PageType::Reuse`] content until the new
    /// owner formats it.
    ///
    /// # Errors
    /// - [`StructureCorruption`](StoreError::StructureCorruption) if the
    ///   chain reaches a page that is not a reuse page
    pub fn take(&self) -> Result<Option<PageId>> {
        let mut head = self.head.lock();
        if head.head.is_none() {
            return Ok(None);
        }

        let page_id = head.head;
        let pinned = self.memory.pin(page_id)?;
        let page = pinned.read();
        if page.page_type() != Some(PageType::Reuse) {
            return Err(StoreError::corruption(
                page_id,
                format!("reuse list entry has page type {:#04x}", page.page_type_raw()),
            ));
        }
        head.head = PageId::from_raw(page.read_u64(NEXT_OFFSET));
        head.len -= 1;
        drop(page);
        drop(head);

        self.memory.stats().page_reused();
        tracing::trace!(%page_id, "page reused");
        Ok(Some(page_id))
    }

    /// Pop a parked page or allocate a fresh one, tagged with `flag`.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if the list is empty and page memory is full
    pub fn take_or_allocate(&self, flag: PageFlag) -> Result<PageId> {
        match self.take()? {
            Some(page_id) => Ok(page_id.with_flag(flag)),
            None => self.memory.allocate(self.partition, flag),
        }
    }

    /// Hand parked pages back to page memory until at most `keep` remain.
    ///
    /// Returns the number of pages released.
    pub fn trim(&self, keep: u64) -> Result<u64> {
        let mut released = 0;
        while self.len() > keep {
            let Some(page_id) = self.take()? else {
                break;
            };
            self.memory.free(page_id)?;
            released += 1;
        }
        if released > 0 {
            tracing::debug!(partition = self.partition, released, "trimmed reuse list");
        }
        Ok(released)
    }
}
