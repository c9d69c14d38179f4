//! Free list: variable-length row storage across fixed-size data pages.
//!
//! # Design
//!
//! - Rows are written into slotted data pages (see [`data_page`]) and
//!   addressed by a [`Link`] to their head fragment
//! - A row larger than one page is split: the tail is cut into full-page
//!   fragments written first, chained tail-to-head, and the head fragment
//!   holding the remainder is written last. The head records the total row
//!   length so readers can size the output buffer before reading on
//! - Pages are grouped into [`BUCKETS`] free-space buckets of width
//!   `page_size / BUCKETS`. A page is listed in bucket `free / width`; pages
//!   with less than one bucket width free are not listed
//!
//! # Bucket bookkeeping
//!
//! The bucket recorded in a data page's header is authoritative and only
//! changes under that page's write lock, in the same critical section as the
//! insert or remove that changed the free space. The hint moves from the old
//! bucket set to the new one in that same critical section. Lock order is
//! page lock, then bucket mutex; bucket mutexes are held only for set
//! operations and never while waiting on a page.
//!
//! An inserter pops a hint, locks the page, and uses it only if the header
//! still names the bucket the hint came from. Pages popped but too small are
//! put back only if their header still names that bucket.
//!
//! Placement starts one bucket below the first bucket guaranteed to fit,
//! probing a few pages there against their exact free space.
//!
//! # Invariants
//!
//! - Every listed page has a hint in the set of the bucket its header names,
//!   except while an inserter holds it popped
//! - A page has at most one hint
//! - A page listed in bucket `b` has at least `b * width` bytes free
//! - A data page left without live items is returned to the reuse list

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::data_page::{self, FLAG_HEAD, UNLISTED};
use crate::storage::memory::PageMemory;
use crate::storage::page::{Link, PageFlag, PageId, PageType};
use crate::storage::reuse::ReuseList;

/// Number of free-space buckets.
pub const BUCKETS: usize = 64;

/// Pages probed in the bucket just below the first guaranteed fit.
const NEAR_FIT_PROBES: usize = 4;

/// Serializer collaborator: a logical row that knows its encoded length.
pub trait Payload {
    /// Exact number of bytes [`encode_into`](Self::encode_into) appends.
    fn encoded_len(&self) -> usize;

    /// Append the encoded row to `out`.
    fn encode_into(&self, out: &mut Vec<u8>);
}

impl Payload for [u8] {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl Payload for Vec<u8> {
    fn encoded_len(&self) -> usize {
        self.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

enum Placement {
    Placed(Link),
    /// Hint was stale; the page is no longer listed in that bucket.
    Stale,
    /// Page is still listed but cannot take the fragment.
    TooSmall,
}

/// Row storage for one partition.
pub struct FreeList {
    name: String,
    memory: Arc<PageMemory>,
    reuse: Arc<ReuseList>,
    checkpoint: Arc<CheckpointLock>,
    buckets: Vec<Mutex<BTreeSet<PageId>>>,
    shift: u32,
    live_rows: AtomicU64,
}

impl FreeList {
    /// Create an empty free list drawing pages from `reuse`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        reuse: Arc<ReuseList>,
        checkpoint: Arc<CheckpointLock>,
    ) -> Self {
        let memory = Arc::clone(reuse.memory());
        let shift = memory.page_size().trailing_zeros() - BUCKETS.trailing_zeros();
        Self {
            name: name.into(),
            memory,
            reuse,
            checkpoint,
            buckets: (0..BUCKETS).map(|_| Mutex::new(BTreeSet::new())).collect(),
            shift,
            live_rows: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rows inserted and not yet removed.
    #[must_use]
    pub fn live_rows(&self) -> u64 {
        self.live_rows.load(Ordering::Acquire)
    }

    /// Largest fragment a single data page can hold.
    #[must_use]
    pub fn max_fragment(&self) -> usize {
        data_page::max_fragment(self.memory.page_size())
    }

    /// Number of hints in each bucket.
    #[must_use]
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.lock().len()).collect()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bucket_for_free(&self, free: usize) -> u8 {
        let bucket = free >> self.shift;
        if bucket == 0 {
            UNLISTED
        } else {
            bucket.min(BUCKETS - 1) as u8
        }
    }

    /// First bucket whose pages are all guaranteed to fit `need` bytes,
    /// clamped to the last bucket.
    fn first_bucket_for(&self, need: usize) -> usize {
        let width = 1usize << self.shift;
        need.div_ceil(width).clamp(1, BUCKETS - 1)
    }

    /// Move the hint of `page_id` from `old` to `new`.
    ///
    /// Called with the page's write lock held.
    fn relist(&self, page_id: PageId, old: u8, new: u8) {
        if old == new {
            return;
        }
        if old != UNLISTED {
            self.buckets[usize::from(old)].lock().remove(&page_id);
        }
        if new != UNLISTED {
            self.buckets[usize::from(new)].lock().insert(page_id);
        }
    }

    /// Put back a hint popped by a scan if the page still belongs in `bucket`.
    fn restore_hint(&self, page_id: PageId, bucket: u8) -> Result<()> {
        let pinned = match self.memory.pin(page_id) {
            Ok(pinned) => pinned,
            Err(StoreError::PageNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let page = pinned.read();
        if page.page_type() == Some(PageType::Data)
            && page.page_id() == page_id
            && data_page::listing(&page) == bucket
        {
            self.buckets[usize::from(bucket)].lock().insert(page_id);
        }
        Ok(())
    }

    /// Serialize `row` and store it.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if a page is needed and none can be obtained.
    ///   Fragments already written for this row are removed again
    pub fn insert<P: Payload + ?Sized>(&self, row: &P) -> Result<Link> {
        let mut bytes = Vec::with_capacity(row.encoded_len());
        row.encode_into(&mut bytes);
        debug_assert_eq!(bytes.len(), row.encoded_len());
        self.insert_bytes(&bytes)
    }

    /// Store `bytes` as one row, fragmenting it if needed.
    pub fn insert_bytes(&self, bytes: &[u8]) -> Result<Link> {
        let total = u32::try_from(bytes.len())
            .map_err(|_| StoreError::MalformedRow(format!("row of {} bytes", bytes.len())))?;
        let _checkpoint = self.checkpoint.read()?;

        let max = self.max_fragment();
        let head_len = match bytes.len() % max {
            0 if !bytes.is_empty() => max,
            rem => rem,
        };
        let (head, tail) = bytes.split_at(head_len);

        let mut written = Vec::new();
        let mut next = Link::NONE;
        for chunk in tail.chunks(max).rev() {
            match self.write_fragment(chunk, 0, next, total) {
                Ok(link) => {
                    written.push(link);
                    next = link;
                    self.memory.stats().fragment_written();
                }
                Err(err) => {
                    self.rollback(&written);
                    return Err(err);
                }
            }
        }

        match self.write_fragment(head, FLAG_HEAD, next, total) {
            Ok(link) => {
                self.live_rows.fetch_add(1, Ordering::AcqRel);
                self.memory.stats().row_inserted();
                Ok(link)
            }
            Err(err) => {
                self.rollback(&written);
                Err(err)
            }
        }
    }

    fn rollback(&self, written: &[Link]) {
        for &link in written {
            if let Err(err) = self.remove_fragment(link, false) {
                tracing::warn!(free_list = %self.name, %link, %err, "failed to roll back fragment");
            }
        }
    }

    fn write_fragment(&self, data: &[u8], flags: u8, next: Link, total: u32) -> Result<Link> {
        if let Some(link) = self.place_in_listed_page(data, flags, next, total)? {
            return Ok(link);
        }

        let page_id = self.reuse.take_or_allocate(PageFlag::Data)?;
        let pinned = self.memory.pin(page_id)?;
        let mut page = pinned.write();
        data_page::init(&mut page, page_id);
        let slot = data_page::insert(&mut page, flags, next, total, data);
        let bucket = self.bucket_for_free(data_page::free_space(&page));
        data_page::set_listing(&mut page, bucket);
        self.relist(page_id, UNLISTED, bucket);
        drop(page);

        Ok(Link::new(page_id, slot))
    }

    fn place_in_listed_page(
        &self,
        data: &[u8],
        flags: u8,
        next: Link,
        total: u32,
    ) -> Result<Option<Link>> {
        let first = self.first_bucket_for(data.len());
        let near = (first > 1).then_some((first - 1, NEAR_FIT_PROBES));
        let rest = (first..BUCKETS).map(|bucket| (bucket, usize::MAX));
        for (bucket, probes) in near.into_iter().chain(rest) {
            if let Some(link) = self.scan_bucket(bucket, probes, data, flags, next, total)? {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    /// Pop hints of `bucket` until a page takes the fragment, the bucket is
    /// exhausted or `probes` pages turned out too small.
    fn scan_bucket(
        &self,
        bucket: usize,
        probes: usize,
        data: &[u8],
        flags: u8,
        next: Link,
        total: u32,
    ) -> Result<Option<Link>> {
        let tag = u8::try_from(bucket).unwrap_or(UNLISTED);
        let mut skipped = Vec::new();
        let outcome = loop {
            if skipped.len() >= probes {
                break Ok(None);
            }
            let candidate = self.buckets[bucket].lock().pop_first();
            let Some(page_id) = candidate else {
                break Ok(None);
            };
            match self.try_place(page_id, tag, data, flags, next, total) {
                Ok(Placement::Placed(link)) => break Ok(Some(link)),
                Ok(Placement::TooSmall) => skipped.push(page_id),
                Ok(Placement::Stale) => {}
                Err(err) => break Err(err),
            }
        };
        for page_id in skipped {
            self.restore_hint(page_id, tag)?;
        }
        outcome
    }

    fn try_place(
        &self,
        page_id: PageId,
        bucket: u8,
        data: &[u8],
        flags: u8,
        next: Link,
        total: u32,
    ) -> Result<Placement> {
        let pinned = match self.memory.pin(page_id) {
            Ok(pinned) => pinned,
            Err(StoreError::PageNotFound(_)) => return Ok(Placement::Stale),
            Err(err) => return Err(err),
        };
        let mut page = pinned.write();
        if page.page_type() != Some(PageType::Data)
            || page.page_id() != page_id
            || data_page::listing(&page) != bucket
        {
            return Ok(Placement::Stale);
        }
        if data_page::free_space(&page) < data.len() {
            return Ok(Placement::TooSmall);
        }

        let slot = data_page::insert(&mut page, flags, next, total, data);
        let new_bucket = self.bucket_for_free(data_page::free_space(&page));
        data_page::set_listing(&mut page, new_bucket);
        // The popped hint is gone already.
        self.relist(page_id, UNLISTED, new_bucket);
        drop(page);

        Ok(Placement::Placed(Link::new(page_id, slot)))
    }

    /// Remove the row headed at `link`, including every fragment.
    ///
    /// # Errors
    /// - [`StoreError::InvalidLink`] if `link` is not the head of a live row
    /// - [`StoreError::StructureCorruption`] if the fragment chain is broken
    pub fn remove_by_link(&self, link: Link) -> Result<()> {
        let _checkpoint = self.checkpoint.read()?;

        let mut current = self.remove_fragment(link, true)?;
        while !current.is_none() {
            current = self.remove_fragment(current, false)?;
        }

        self.live_rows.fetch_sub(1, Ordering::AcqRel);
        self.memory.stats().row_removed();
        Ok(())
    }

    /// Remove one fragment and return the link of the next one.
    fn remove_fragment(&self, link: Link, head: bool) -> Result<Link> {
        let invalid = || {
            if head {
                StoreError::InvalidLink(link)
            } else {
                StoreError::corruption(link.page_id(), format!("missing row fragment {link}"))
            }
        };

        let pinned = match self.memory.pin(link.page_id()) {
            Ok(pinned) => pinned,
            Err(StoreError::PageNotFound(_)) => return Err(invalid()),
            Err(err) => return Err(err),
        };
        let mut page = pinned.write();
        if page.page_type() != Some(PageType::Data) || page.page_id() != link.page_id() {
            return Err(invalid());
        }
        let item = data_page::read(&page, link.item())?.ok_or_else(invalid)?;
        if item.is_head() != head {
            return Err(invalid());
        }
        let next = item.next;
        data_page::remove(&mut page, link.item());

        let page_id = link.page_id();
        let old_bucket = data_page::listing(&page);
        if data_page::live_count(&page) == 0 {
            data_page::set_listing(&mut page, UNLISTED);
            self.relist(page_id, old_bucket, UNLISTED);
            drop(page);
            self.reuse.recycle(page_id)?;
        } else {
            let new_bucket = self.bucket_for_free(data_page::free_space(&page));
            data_page::set_listing(&mut page, new_bucket);
            self.relist(page_id, old_bucket, new_bucket);
        }
        Ok(next)
    }

    /// Reassemble the row headed at `link`.
    ///
    /// # Errors
    /// - [`StoreError::InvalidLink`] if `link` is not the head of a live row
    /// - [`StoreError::FragmentLengthMismatch`] if fragment lengths disagree with the head
    /// - [`StoreError::StructureCorruption`] if the chain leads to a non-data page
    pub fn read_payload(&self, link: Link) -> Result<Vec<u8>> {
        let invalid = || StoreError::InvalidLink(link);
        let pinned = match self.memory.pin(link.page_id()) {
            Ok(pinned) => pinned,
            Err(StoreError::PageNotFound(_)) => return Err(invalid()),
            Err(err) => return Err(err),
        };
        let page = pinned.read();
        if page.page_type() != Some(PageType::Data) || page.page_id() != link.page_id() {
            return Err(invalid());
        }
        let head = data_page::read(&page, link.item())?.ok_or_else(invalid)?;
        if !head.is_head() {
            return Err(invalid());
        }

        let total = head.total_len as usize;
        let mismatch = |actual: usize| StoreError::FragmentLengthMismatch {
            link,
            expected: total,
            actual,
        };
        if head.data.len() > total {
            return Err(mismatch(head.data.len()));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(head.data);
        let mut next = head.next;
        drop(page);

        while !next.is_none() {
            let pinned = self.memory.pin(next.page_id()).map_err(|_| {
                StoreError::corruption(next.page_id(), format!("fragment {next} of {link} is gone"))
            })?;
            let page = pinned.read();
            if page.page_type() != Some(PageType::Data) {
                return Err(StoreError::corruption(
                    next.page_id(),
                    format!("fragment {next} of {link} is not on a data page"),
                ));
            }
            let fragment = data_page::read(&page, next.item())?
                .filter(|item| !item.is_head())
                .ok_or_else(|| {
                    StoreError::corruption(next.page_id(), format!("fragment {next} of {link} is gone"))
                })?;
            let actual = out.len() + fragment.data.len();
            if fragment.total_len as usize != total || actual > total {
                return Err(mismatch(actual));
            }
            out.extend_from_slice(fragment.data);
            next = fragment.next;
        }

        if out.len() != total {
            return Err(mismatch(out.len()));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("name", &self.name)
            .field("partition", &self.reuse.partition())
            .field("live_rows", &self.live_rows())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopIoStats;
    use crate::storage::page::MIN_PAGE_SIZE;
    use proptest::prelude::*;
    use std::time::Duration;

    fn free_list(page_size: usize, max_pages: u64) -> FreeList {
        let memory = PageMemory::new(page_size, max_pages, Arc::new(NoopIoStats));
        let reuse = ReuseList::new(memory, 0);
        let checkpoint = Arc::new(CheckpointLock::new(Duration::from_secs(1)));
        FreeList::new("test", reuse, checkpoint)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_small_row_roundtrip() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(100, 1);
        let link = list.insert(&row).expect("insert");
        assert!(!link.is_none());
        assert_eq!(list.read_payload(link).expect("read"), row);
        assert_eq!(list.live_rows(), 1);
    }

    #[test]
    fn test_empty_row_roundtrip() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let link = list.insert(&[][..]).expect("insert");
        assert!(list.read_payload(link).expect("read").is_empty());
        list.remove_by_link(link).expect("remove");
    }

    #[test]
    fn test_fragmented_row_roundtrip() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(list.max_fragment() * 3 + 17, 9);
        let link = list.insert(&row).expect("insert");
        assert_eq!(list.read_payload(link).expect("read"), row);
        assert_eq!(list.reuse.memory().allocated_pages(), 4);

        list.remove_by_link(link).expect("remove");
        assert_eq!(list.reuse.len(), 4);
        assert_eq!(list.live_rows(), 0);
    }

    #[test]
    fn test_exact_multiple_of_fragment() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(list.max_fragment() * 2, 3);
        let link = list.insert(&row).expect("insert");
        assert_eq!(list.read_payload(link).expect("read"), row);
        assert_eq!(list.reuse.memory().allocated_pages(), 2);
    }

    #[test]
    fn test_remove_then_read_is_invalid_link() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let keep = list.insert(&pattern(50, 0)).expect("insert");
        let link = list.insert(&pattern(60, 1)).expect("insert");

        list.remove_by_link(link).expect("remove");
        assert!(matches!(list.read_payload(link), Err(StoreError::InvalidLink(l)) if l == link));
        assert!(matches!(list.remove_by_link(link), Err(StoreError::InvalidLink(_))));
        assert_eq!(list.read_payload(keep).expect("read"), pattern(50, 0));
    }

    #[test]
    fn test_remove_last_row_recycles_page() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let link = list.insert(&pattern(10, 0)).expect("insert");
        list.remove_by_link(link).expect("remove");

        assert_eq!(list.reuse.len(), 1);
        assert!(matches!(list.read_payload(link), Err(StoreError::InvalidLink(_))));

        // The page left its bucket when it was recycled and comes back from the reuse list.
        assert_eq!(list.bucket_sizes().iter().sum::<usize>(), 0);
        let again = list.insert(&pattern(20, 1)).expect("insert");
        assert_eq!(again.page_id(), link.page_id());
        assert!(list.reuse.is_empty());
        assert_eq!(list.reuse.memory().allocated_pages(), 1);
    }

    #[test]
    fn test_non_head_link_is_invalid() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(list.max_fragment() + 10, 0);
        let head = list.insert(&row).expect("insert");

        let pinned = list.memory.pin(head.page_id()).expect("pin");
        let tail = data_page::read(&pinned.read(), head.item())
            .expect("read")
            .expect("live")
            .next;
        assert!(!tail.is_none());
        assert!(matches!(list.read_payload(tail), Err(StoreError::InvalidLink(_))));
        assert!(matches!(list.remove_by_link(tail), Err(StoreError::InvalidLink(_))));
    }

    #[test]
    fn test_small_rows_share_pages() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let links: Vec<Link> = (0..10u8)
            .map(|i| list.insert(&pattern(40, i)).expect("insert"))
            .collect();
        assert_eq!(list.reuse.memory().allocated_pages(), 1);
        for (i, link) in links.iter().enumerate() {
            assert_eq!(link.page_id(), links[0].page_id());
            assert_eq!(list.read_payload(*link).expect("read"), pattern(40, i as u8));
        }
    }

    #[test]
    fn test_freed_space_is_reused() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let big = list.insert(&pattern(700, 0)).expect("insert");
        let small = list.insert(&pattern(200, 1)).expect("insert");
        assert_eq!(big.page_id(), small.page_id());

        list.remove_by_link(big).expect("remove");
        let other = list.insert(&pattern(500, 2)).expect("insert");
        assert_eq!(other.page_id(), small.page_id());
        assert_eq!(list.reuse.memory().allocated_pages(), 1);
    }

    #[test]
    fn test_exact_fit_below_guaranteed_bucket() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let first = list.insert(&pattern(100, 0)).expect("insert");
        let free = {
            let pinned = list.memory.pin(first.page_id()).expect("pin");
            data_page::free_space(&pinned.read())
        };
        // The page sits in the bucket below the first one guaranteed to fit `free`.
        assert_ne!(free % (MIN_PAGE_SIZE / BUCKETS), 0);

        let exact = list.insert(&pattern(free, 1)).expect("insert");
        assert_eq!(exact.page_id(), first.page_id());
        assert_eq!(list.reuse.memory().allocated_pages(), 1);
        assert_eq!(list.read_payload(exact).expect("read"), pattern(free, 1));
    }

    #[test]
    fn test_bucket_hints_follow_pages() {
        let list = free_list(MIN_PAGE_SIZE, 64);
        let links: Vec<Link> = (0..40u8)
            .map(|i| list.insert(&pattern(60 + usize::from(i) * 3, i)).expect("insert"))
            .collect();
        let pages = list.reuse.memory().allocated_pages();

        // Every removal moves its page down a bucket or off the list.
        for (i, link) in links.iter().enumerate() {
            list.remove_by_link(*link).expect("remove");
            let hints: usize = list.bucket_sizes().iter().sum();
            assert!(hints as u64 <= pages, "{hints} hints for {pages} pages after {i} removals");
        }
        assert_eq!(list.bucket_sizes().iter().sum::<usize>(), 0);
        assert_eq!(list.reuse.len(), pages);
    }

    #[test]
    fn test_out_of_memory_rolls_back_fragments() {
        let list = free_list(MIN_PAGE_SIZE, 3);
        let keep = list.insert(&pattern(100, 7)).expect("insert");

        // Needs four pages; only two more exist.
        let row = pattern(list.max_fragment() * 3 + 1, 1);
        let err = list.insert(&row).expect_err("no room");
        assert!(matches!(err, StoreError::OutOfMemory { .. }));
        assert_eq!(list.live_rows(), 1);
        assert_eq!(list.read_payload(keep).expect("read"), pattern(100, 7));

        // The fragments written before the failure went back to the reuse list.
        assert_eq!(list.reuse.len(), 2);
        let fits = pattern(list.max_fragment() + 5, 2);
        let link = list.insert(&fits).expect("insert after rollback");
        assert_eq!(list.read_payload(link).expect("read"), fits);
    }

    #[test]
    fn test_fragment_length_mismatch_detected() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(list.max_fragment() + 100, 0);
        let head = list.insert(&row).expect("insert");

        // Shrink the recorded total length of the head.
        let pinned = list.memory.pin(head.page_id()).expect("pin");
        {
            let mut page = pinned.write();
            let offset = usize::from(page.read_u16(32 + usize::from(head.item()) * 4));
            page.write_u32(offset + 9, 150);
        }
        let err = list.read_payload(head).expect_err("mismatch");
        assert!(matches!(err, StoreError::FragmentLengthMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_broken_chain_is_corruption() {
        let list = free_list(MIN_PAGE_SIZE, 16);
        let row = pattern(list.max_fragment() + 100, 0);
        let head = list.insert(&row).expect("insert");
        let tail = {
            let pinned = list.memory.pin(head.page_id()).expect("pin");
            let page = pinned.read();
            data_page::read(&page, head.item()).expect("read").expect("live").next
        };

        // Recycle the tail page behind the row's back.
        list.reuse.recycle(tail.page_id()).expect("recycle");
        let err = list.read_payload(head).expect_err("chain broken");
        assert!(matches!(err, StoreError::StructureCorruption { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_payload_roundtrip(rows in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..4000), 1..12)
        ) {
            let list = free_list(MIN_PAGE_SIZE, 512);
            let links: Vec<Link> = rows.iter().map(|row| list.insert(row).expect("insert")).collect();
            for (row, link) in rows.iter().zip(&links) {
                prop_assert_eq!(&list.read_payload(*link).expect("read"), row);
            }
            for link in links {
                list.remove_by_link(link).expect("remove");
            }
            prop_assert_eq!(list.live_rows(), 0);
        }
    }
}
