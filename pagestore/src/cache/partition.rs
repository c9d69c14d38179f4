//! One partition of the cache: a free list holding row payloads, a data tree
//! indexing them by key and a pending tree indexing rows that expire.
//!
//! # Design
//!
//! - All three structures draw pages from the partition's single reuse list,
//!   so a leaf emptied by a merge can come back as a data page and the other
//!   way around
//! - Writers of the same key are serialized by a striped mutex picked by key
//!   hash; writers of different stripes run concurrently
//! - Every operation holds the checkpoint read side for its whole duration so
//!   a checkpoint never observes a row placed but not yet indexed
//!
//! # Invariants
//!
//! - Each live row has exactly one data tree entry
//! - A row with a non-zero expire time has exactly one pending tree entry,
//!   removed together with the row
//! - An operation that fails leaves the previous row reachable

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::cache::row::CacheRow;
use crate::cache::rows::{DataRow, PendingRow, key_hash};
use crate::error::{Result, StoreError};
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::{BPlusTree, FreeList, Link, ReuseList, TreeCursor};

/// Number of key lock stripes per partition.
pub const KEY_STRIPES: usize = 64;

/// A stored row together with its data tree entry.
#[derive(Debug, Clone)]
struct Located {
    entry: DataRow,
    row: CacheRow,
}

/// Storage of one partition.
pub struct PartitionStore {
    partition: u16,
    reuse: Arc<ReuseList>,
    checkpoint: Arc<CheckpointLock>,
    free_list: FreeList,
    data: BPlusTree<DataRow>,
    pending: BPlusTree<PendingRow>,
    stripes: Vec<Mutex<()>>,
}

impl PartitionStore {
    /// Create the structures of `reuse`'s partition.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if the tree pages cannot be allocated
    pub fn create(reuse: Arc<ReuseList>, checkpoint: Arc<CheckpointLock>) -> Result<Self> {
        let partition = reuse.partition();
        let tree_id = u32::from(partition) * 2;
        let free_list = FreeList::new(
            format!("rows-{partition}"),
            Arc::clone(&reuse),
            Arc::clone(&checkpoint),
        );
        let data = BPlusTree::create(
            format!("data-{partition}"),
            tree_id + 1,
            Arc::clone(&reuse),
            Arc::clone(&checkpoint),
        )?;
        let pending = BPlusTree::create(
            format!("pending-{partition}"),
            tree_id + 2,
            Arc::clone(&reuse),
            Arc::clone(&checkpoint),
        )?;

        Ok(Self {
            partition,
            reuse,
            checkpoint,
            free_list,
            data,
            pending,
            stripes: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    #[must_use]
    pub const fn partition(&self) -> u16 {
        self.partition
    }

    #[must_use]
    pub const fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    #[must_use]
    pub const fn data_tree(&self) -> &BPlusTree<DataRow> {
        &self.data
    }

    #[must_use]
    pub const fn pending_tree(&self) -> &BPlusTree<PendingRow> {
        &self.pending
    }

    #[must_use]
    pub fn reuse(&self) -> &Arc<ReuseList> {
        &self.reuse
    }

    /// Number of stored rows, tombstones included.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.data.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn stripe(&self, hash: u32) -> MutexGuard<'_, ()> {
        self.stripes[hash as usize % KEY_STRIPES].lock()
    }

    /// Store `row`, replacing any row with the same cache id and key.
    ///
    /// Returns the link of the new row.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if the row or its index entries cannot be
    ///   placed; the previous row, if any, is left in place
    pub fn put(&self, row: &CacheRow) -> Result<Link> {
        let _checkpoint = self.checkpoint.read()?;
        let hash = key_hash(&row.key);
        let _stripe = self.stripe(hash);
        self.put_locked(row, hash)
    }

    fn put_locked(&self, row: &CacheRow, hash: u32) -> Result<Link> {
        let existing = self.lookup(row.cache_id, hash, &row.key)?;

        let link = self.free_list.insert(row)?;
        let entry = DataRow {
            cache_id: row.cache_id,
            hash,
            link,
        };
        if let Err(err) = self.data.put(entry) {
            self.undo_insert(link, None, None);
            return Err(err);
        }
        let pending = row.expires().then_some(PendingRow {
            expire_time: row.expire_time,
            cache_id: row.cache_id,
            link,
            key_hash: hash,
            tombstone: row.tombstone,
        });
        if let Some(Err(err)) = pending.map(|pending| self.pending.put(pending)) {
            self.undo_insert(link, Some(entry), None);
            return Err(err);
        }

        if let Some(Err(err)) = existing.map(|old| self.unlink(&old)) {
            self.undo_insert(link, Some(entry), pending);
            return Err(err);
        }
        tracing::trace!(partition = self.partition, %link, "row stored");
        Ok(link)
    }

    /// Best-effort removal of a row whose put could not complete.
    fn undo_insert(&self, link: Link, entry: Option<DataRow>, pending: Option<PendingRow>) {
        if let Some(Err(err)) = pending.map(|pending| self.pending.remove(&pending)) {
            tracing::warn!(partition = self.partition, %link, %err, "failed to undo pending entry");
        }
        if let Some(Err(err)) = entry.map(|entry| self.data.remove(&entry)) {
            tracing::warn!(partition = self.partition, %link, %err, "failed to undo data entry");
        }
        if let Err(err) = self.free_list.remove_by_link(link) {
            tracing::warn!(partition = self.partition, %link, %err, "failed to undo row insert");
        }
    }

    /// Drop a located row from both trees and the free list.
    fn unlink(&self, located: &Located) -> Result<()> {
        self.data.remove(&located.entry)?;
        if located.row.expires() {
            self.pending.remove(&PendingRow {
                expire_time: located.row.expire_time,
                cache_id: located.entry.cache_id,
                link: located.entry.link,
                key_hash: located.entry.hash,
                tombstone: located.row.tombstone,
            })?;
        }
        self.free_list.remove_by_link(located.entry.link)
    }

    fn lookup(&self, cache_id: u32, hash: u32, key: &[u8]) -> Result<Option<Located>> {
        let cursor = self.data.find(
            Bound::Included(DataRow::lower(cache_id, hash)),
            Bound::Included(DataRow::upper(cache_id, hash)),
        )?;
        for entry in cursor {
            let entry = entry?;
            let row = CacheRow::decode(&self.free_list.read_payload(entry.link)?)?;
            if row.key == key {
                return Ok(Some(Located { entry, row }));
            }
        }
        Ok(None)
    }

    /// Read the row stored under `key`, tombstones included.
    pub fn get(&self, cache_id: u32, key: &[u8]) -> Result<Option<CacheRow>> {
        let hash = key_hash(key);
        Ok(self.lookup(cache_id, hash, key)?.map(|located| located.row))
    }

    /// Remove the row stored under `key` outright.
    ///
    /// Returns whether a row, live or tombstone, was removed.
    pub fn remove(&self, cache_id: u32, key: &[u8]) -> Result<bool> {
        let _checkpoint = self.checkpoint.read()?;
        let hash = key_hash(key);
        let _stripe = self.stripe(hash);
        match self.lookup(cache_id, hash, key)? {
            Some(located) => {
                self.unlink(&located)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the row stored under `key` with a tombstone expiring at `expire_time`.
    ///
    /// Returns whether a live row was replaced. Nothing is written when there
    /// is no row or the row already is a tombstone.
    pub fn remove_with_tombstone(
        &self,
        cache_id: u32,
        key: &[u8],
        version: u64,
        expire_time: u64,
    ) -> Result<bool> {
        let _checkpoint = self.checkpoint.read()?;
        let hash = key_hash(key);
        let _stripe = self.stripe(hash);
        match self.lookup(cache_id, hash, key)? {
            Some(located) if !located.row.tombstone => {
                let tombstone = CacheRow::tombstone(cache_id, key, version, expire_time);
                self.put_locked(&tombstone, hash)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cursor over pending entries expiring at or before `now_ms`, oldest first.
    pub fn due(&self, now_ms: u64) -> Result<TreeCursor<'_, PendingRow>> {
        self.pending.find(
            Bound::Unbounded,
            Bound::Included(PendingRow::upper_bound(now_ms)),
        )
    }

    /// Pending entries expiring at or before `now_ms`, oldest first.
    pub fn due_rows(&self, now_ms: u64, limit: usize) -> Result<Vec<PendingRow>> {
        self.due(now_ms)?.take(limit).collect()
    }

    /// Remove an expired row.
    ///
    /// The pending tree decides: if `pending` is no longer in it the row was
    /// already expired, replaced or removed, and nothing happens.
    ///
    /// # Errors
    /// - [`StoreError::StructureCorruption`] if the pending entry has no data entry
    pub fn expire_row(&self, pending: &PendingRow) -> Result<bool> {
        let _checkpoint = self.checkpoint.read()?;
        let _stripe = self.stripe(pending.key_hash);
        if !self.pending.removex(pending)? {
            return Ok(false);
        }

        if !self.data.removex(&pending.data_row())? {
            return Err(StoreError::corruption(
                pending.link.page_id(),
                format!("pending entry {pending:?} has no data entry"),
            ));
        }
        self.free_list.remove_by_link(pending.link)?;
        tracing::trace!(
            partition = self.partition,
            link = %pending.link,
            tombstone = pending.tombstone,
            "row expired"
        );
        Ok(true)
    }
}

impl std::fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStore")
            .field("partition", &self.partition)
            .field("rows", &self.data.size())
            .field("pending", &self.pending.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopIoStats;
    use crate::storage::{PageMemory, PageType, page::MIN_PAGE_SIZE};

    fn store() -> PartitionStore {
        let memory = PageMemory::new(MIN_PAGE_SIZE, 4096, Arc::new(NoopIoStats));
        PartitionStore::create(
            ReuseList::new(memory, 3),
            Arc::new(CheckpointLock::default()),
        )
        .expect("create partition")
    }

    #[test]
    fn test_put_get_replace() {
        let store = store();
        let first = store.put(&CacheRow::new(1, "k", "v1")).expect("put");
        assert_eq!(first.page_id().partition(), 3);
        let second = store.put(&CacheRow::new(1, "k", "v2")).expect("replace");
        assert_ne!(first, second);

        let row = store.get(1, b"k").expect("get").expect("present");
        assert_eq!(row.value, b"v2");
        assert_eq!(store.len(), 1);
        assert_eq!(store.free_list().live_rows(), 1);

        // Same key, other cache: a separate row.
        store.put(&CacheRow::new(2, "k", "other")).expect("put");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1, b"k").expect("get").expect("present").value, b"v2");
    }

    #[test]
    fn test_hash_collisions_resolved_by_key() {
        let store = store();
        // Force the colliding case by storing many keys; all must resolve.
        for i in 0..500 {
            store
                .put(&CacheRow::new(1, format!("key-{i}"), format!("value-{i}")))
                .expect("put");
        }
        for i in 0..500 {
            let row = store
                .get(1, format!("key-{i}").as_bytes())
                .expect("get")
                .expect("present");
            assert_eq!(row.value, format!("value-{i}").as_bytes());
        }
        store.data_tree().validate().expect("valid");
    }

    #[test]
    fn test_remove() {
        let store = store();
        store.put(&CacheRow::new(1, "k", "v").with_expire_time(100)).expect("put");
        assert_eq!(store.pending_tree().size(), 1);

        assert!(store.remove(1, b"k").expect("remove"));
        assert!(!store.remove(1, b"k").expect("second remove"));
        assert!(store.get(1, b"k").expect("get").is_none());
        assert!(store.pending_tree().is_empty());
        assert_eq!(store.free_list().live_rows(), 0);
    }

    #[test]
    fn test_failed_replace_drops_new_row() {
        let store = store();
        store.put(&CacheRow::new(1, "k", "old").with_expire_time(100)).expect("put");

        // Damage the pending tree so unlinking the old row fails.
        store
            .reuse()
            .memory()
            .pin(store.pending_tree().root())
            .expect("pin")
            .write()
            .set_page_type(PageType::Data);

        let err = store.put(&CacheRow::new(1, "k", "new")).expect_err("unlink fails");
        assert!(err.is_corruption());
        // The new row is not left indexed next to the old one.
        assert_eq!(store.free_list().live_rows(), 1);
        assert!(store.data_tree().is_empty());
    }

    #[test]
    fn test_replace_moves_pending_entry() {
        let store = store();
        store.put(&CacheRow::new(1, "k", "v").with_expire_time(100)).expect("put");
        store.put(&CacheRow::new(1, "k", "v").with_expire_time(200)).expect("put");

        assert!(store.due_rows(150, 10).expect("due").is_empty());
        let due = store.due_rows(200, 10).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].expire_time, 200);
    }

    #[test]
    fn test_tombstone_then_expire() {
        let store = store();
        store.put(&CacheRow::new(1, "k", "v")).expect("put");
        assert!(store.remove_with_tombstone(1, b"k", 2, 500).expect("tombstone"));
        assert!(!store.remove_with_tombstone(1, b"k", 3, 600).expect("already dead"));

        let row = store.get(1, b"k").expect("get").expect("tombstone stored");
        assert!(row.tombstone);

        let due = store.due_rows(500, 10).expect("due");
        assert_eq!(due.len(), 1);
        assert!(due[0].tombstone);
        assert!(store.expire_row(&due[0]).expect("expire"));
        assert!(!store.expire_row(&due[0]).expect("expired once"));
        assert!(store.get(1, b"k").expect("get").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_due_rows_respects_limit_and_order() {
        let store = store();
        for i in 0..20u64 {
            store
                .put(&CacheRow::new(1, format!("k{i}"), "v").with_expire_time(1000 - i))
                .expect("put");
        }
        let due = store.due_rows(990, 5).expect("due");
        let times: Vec<u64> = due.iter().map(|row| row.expire_time).collect();
        assert_eq!(times, vec![981, 982, 983, 984, 985]);
    }
}
