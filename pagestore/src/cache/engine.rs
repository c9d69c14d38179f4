//! Partitioned cache engine.
//!
//! The engine owns the page memory, one [`PartitionStore`] per partition,
//! the checkpointer and the expiration queue. Keys are routed to partitions
//! by the [`AffinityFunction`].
//!
//! # Design
//!
//! - Writes record an operation with the checkpointer and wake the
//!   maintenance task (see [`crate::cache::worker`]) once a checkpoint is due
//! - Removal leaves a tombstone expiring `tombstone_ttl` later, unless the
//!   ttl is zero in which case the row is dropped right away
//! - Expiry first moves due pending rows into the [`ExpirationQueue`], then
//!   drains it; the pending tree decides whether a popped row still applies
//!
//! # Invariants
//!
//! - Every row lives in the partition its key's affinity maps to
//! - Row versions are unique and increase across the whole engine

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::affinity::{AffinityFunction, CacheKey};
use crate::cache::expiry::ExpirationQueue;
use crate::cache::partition::PartitionStore;
use crate::cache::row::CacheRow;
use crate::cache::rows::PendingRow;
use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::metrics::IoStatistics;
use crate::storage::checkpoint::{
    CheckpointLock, CheckpointResult, CheckpointSink, FileCheckpointSink, NullCheckpointSink,
};
use crate::storage::{Checkpointer, Link, PageMemory, ReuseList, SystemTimeSource, TimeSource};

/// Writes between two checks of the checkpoint thresholds.
const CHECKPOINT_CHECK_INTERVAL: u64 = 128;

/// Outcome of one expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireResult {
    /// Rows removed by this pass.
    pub expired: usize,
    /// Rows still queued after the pass.
    pub remaining: usize,
}

/// A partitioned key/value store over page memory.
pub struct Engine {
    config: EngineConfig,
    memory: Arc<PageMemory>,
    checkpointer: Checkpointer,
    affinity: AffinityFunction,
    partitions: Vec<PartitionStore>,
    queue: ExpirationQueue,
    time: Arc<dyn TimeSource>,
    versions: AtomicU64,
    writes: AtomicU64,
    notify: Arc<Notify>,
}

impl Engine {
    /// Create an engine with every partition's structures allocated.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if `max_pages` cannot hold the tree
    ///   pages of every partition
    pub fn new(
        config: EngineConfig,
        time: Arc<dyn TimeSource>,
        stats: Arc<dyn IoStatistics>,
        sink: Box<dyn CheckpointSink>,
    ) -> Result<Arc<Self>> {
        let memory = PageMemory::new(config.page_size, config.max_pages, stats);
        let lock = Arc::new(CheckpointLock::new(config.checkpoint_timeout));
        let checkpointer = Checkpointer::new(
            Arc::clone(&memory),
            Arc::clone(&lock),
            config.checkpoint,
            sink,
        );

        let partitions = (0..config.partitions)
            .map(|partition| {
                PartitionStore::create(
                    ReuseList::new(Arc::clone(&memory), partition),
                    Arc::clone(&lock),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            partitions = config.partitions,
            page_size = config.page_size,
            max_pages = config.max_pages,
            "engine started"
        );

        Ok(Arc::new(Self {
            affinity: AffinityFunction::new(config.partitions),
            config,
            memory,
            checkpointer,
            partitions,
            queue: ExpirationQueue::new(),
            time,
            versions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }))
    }

    /// Create an engine on the system clock, writing checkpoints to
    /// `config.checkpoint_path` when set.
    ///
    /// # Errors
    /// - [`StoreError::Io`] if the checkpoint file cannot be opened
    /// - [`StoreError::OutOfMemory`] as for [`Engine::new`]
    pub fn from_config(config: EngineConfig, stats: Arc<dyn IoStatistics>) -> Result<Arc<Self>> {
        let sink: Box<dyn CheckpointSink> = match &config.checkpoint_path {
            Some(path) => Box::new(FileCheckpointSink::open(path)?),
            None => Box::new(NullCheckpointSink),
        };
        Self::new(config, Arc::new(SystemTimeSource), stats, sink)
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    #[must_use]
    pub const fn affinity(&self) -> &AffinityFunction {
        &self.affinity
    }

    #[must_use]
    pub const fn queue(&self) -> &ExpirationQueue {
        &self.queue
    }

    #[must_use]
    pub const fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Signal shared with the maintenance task.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    #[must_use]
    pub fn partitions(&self) -> &[PartitionStore] {
        &self.partitions
    }

    /// Store of `partition`, if it exists.
    #[must_use]
    pub fn partition(&self, partition: u16) -> Option<&PartitionStore> {
        self.partitions.get(usize::from(partition))
    }

    /// Store owning `key`.
    #[must_use]
    pub fn partition_for(&self, key: &CacheKey) -> &PartitionStore {
        // The affinity function never maps outside 0..partitions.
        &self.partitions[usize::from(self.affinity.partition(key))]
    }

    /// Number of stored rows over all partitions, tombstones included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.partitions.iter().map(PartitionStore::len).sum()
    }

    /// Current time of the engine's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn deadline(now_ms: u64, ttl: Duration) -> u64 {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        // Zero means "never expires" on disk, so the earliest deadline is 1.
        now_ms.saturating_add(ttl_ms).max(1)
    }

    fn after_write(&self) {
        self.checkpointer.record_op();
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % CHECKPOINT_CHECK_INTERVAL == 0 && self.checkpointer.should_checkpoint() {
            self.notify.notify_one();
        }
    }

    /// Store `value` under `key` in cache `cache_id`.
    ///
    /// With a `ttl` the row expires that long from now.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if the row cannot be placed; the previous
    ///   value stays readable
    /// - [`StoreError::LockTimeout`] if a checkpoint holds the store too long
    pub fn put(
        &self,
        cache_id: u32,
        key: &CacheKey,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<Link> {
        let expire_time = ttl.map_or(0, |ttl| Self::deadline(self.time.now_ms(), ttl));
        let row = CacheRow::new(cache_id, key.bytes(), value)
            .with_version(self.next_version())
            .with_expire_time(expire_time);

        let link = self.partition_for(key).put(&row)?;
        self.after_write();
        Ok(link)
    }

    /// Read the live row stored under `key`.
    ///
    /// Tombstones and rows past their expire time read as absent.
    pub fn get(&self, cache_id: u32, key: &CacheKey) -> Result<Option<CacheRow>> {
        let now = self.time.now_ms();
        Ok(self
            .partition_for(key)
            .get(cache_id, key.bytes())?
            .filter(|row| !row.tombstone && !row.is_expired(now)))
    }

    /// Remove the row stored under `key`.
    ///
    /// Returns whether a row was removed.
    pub fn remove(&self, cache_id: u32, key: &CacheKey) -> Result<bool> {
        let store = self.partition_for(key);
        let removed = if self.config.tombstone_ttl.is_zero() {
            store.remove(cache_id, key.bytes())?
        } else {
            let expire_time = Self::deadline(self.time.now_ms(), self.config.tombstone_ttl);
            store.remove_with_tombstone(cache_id, key.bytes(), self.next_version(), expire_time)?
        };
        if removed {
            self.after_write();
        }
        Ok(removed)
    }

    /// Move pending rows due at `now_ms` into the expiration queue.
    ///
    /// Scans partitions in order and stops once `limit` rows were queued.
    /// Rows already in the queue are passed over and do not count. Returns
    /// the number of rows queued.
    pub fn fill_expiry_queue(&self, now_ms: u64, limit: usize) -> Result<usize> {
        let mut queued = 0;
        for store in &self.partitions {
            if queued >= limit {
                break;
            }
            for row in store.due(now_ms)? {
                if self.queue.push(row?) {
                    queued += 1;
                    if queued >= limit {
                        break;
                    }
                }
            }
        }
        Ok(queued)
    }

    /// Expire at most `batch` rows due at `now_ms`.
    ///
    /// # Errors
    /// - [`StoreError::StructureCorruption`] if a queued row points outside
    ///   the engine's partitions or has no data entry
    pub fn expire(&self, now_ms: u64, batch: usize) -> Result<ExpireResult> {
        if self.queue.len() < batch {
            self.fill_expiry_queue(now_ms, batch - self.queue.len())?;
        }

        let mut expired = 0;
        while expired < batch {
            let Some(row) = self.queue.pop() else {
                break;
            };
            if self.expire_pending(&row)? {
                expired += 1;
                self.after_write();
            }
        }

        if expired > 0 {
            tracing::debug!(expired, remaining = self.queue.len(), "expiry pass");
        }
        Ok(ExpireResult {
            expired,
            remaining: self.queue.len(),
        })
    }

    fn expire_pending(&self, row: &PendingRow) -> Result<bool> {
        let partition = row.partition();
        let store = self.partition(partition).ok_or_else(|| {
            StoreError::corruption(
                row.link.page_id(),
                format!("pending row in unknown partition {partition}"),
            )
        })?;
        store.expire_row(row)
    }

    /// Checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        self.checkpointer.force_checkpoint()
    }

    /// Checkpoint if a threshold of the checkpoint configuration is met.
    pub fn maybe_checkpoint(&self) -> Result<Option<CheckpointResult>> {
        self.checkpointer.maybe_checkpoint()
    }

    /// Hand recycled pages back to page memory, keeping at most `keep` parked
    /// per partition. Returns the number of pages released.
    pub fn release_free_pages(&self, keep: u64) -> Result<u64> {
        let _checkpoint = self.checkpointer.lock().read()?;
        let mut released = 0;
        for store in &self.partitions {
            released += store.reuse().trim(keep)?;
        }
        Ok(released)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Wake the maintenance task so it observes the engine is gone.
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("partitions", &self.partitions.len())
            .field("memory", &self.memory)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
