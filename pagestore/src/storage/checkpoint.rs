//! Checkpoint coordination and snapshot passes.
//!
//! A checkpoint writes every dirty page to a [`CheckpointSink`] while no
//! structural mutation is in flight.
//!
//! # Checkpoint Lock
//!
//! [`CheckpointLock`] is a read/write lock with two roles:
//! - read side: held by every free-list and tree operation that mutates page
//!   content, for the duration of the operation. Any number of holders; the
//!   side is recursive so a holder may re-enter it while a writer is queued
//! - write side: held exclusively by one checkpoint pass
//!
//! Both sides are acquired with a bound. Failing to acquire is reported as
//! [`StoreError::LockTimeout`]; a checkpoint that cannot get the write side
//! does not run at all.
//!
//! # Checkpoint Triggers
//!
//! Checkpoints can be triggered by:
//! - Mutation count threshold (default: 10,000 operations)
//! - Dirty page threshold (default: 4096 pages)
//! - Manual trigger via [`Checkpointer::force_checkpoint`]
//!
//! # Checkpoint Process
//!
//! 1. Acquire the write side of the checkpoint lock
//! 2. Stamp a CRC32 into every dirty page and hand it to the sink
//! 3. Let the sink make the snapshot durable
//! 4. Only then clear the dirty flags and advance the epoch

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};
use crate::storage::memory::PageMemory;
use crate::storage::page::{Page, PageId};

/// Default number of mutations between checkpoints.
pub const DEFAULT_OPS_THRESHOLD: u64 = 10_000;

/// Default number of dirty pages that triggers a checkpoint.
pub const DEFAULT_DIRTY_PAGES_THRESHOLD: u64 = 4096;

/// Default bound for acquiring either side of the checkpoint lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const SNAPSHOT_MAGIC: &[u8; 4] = b"PSCP";
const SNAPSHOT_END_MAGIC: &[u8; 4] = b"PEND";

/// Observable state of the checkpoint lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    ReadHeld,
    WriteHeld,
}

/// The read/write lock coordinating mutators with checkpoint passes.
#[derive(Debug)]
pub struct CheckpointLock {
    lock: RwLock<()>,
    timeout: Duration,
}

/// Read side of the checkpoint lock.
#[derive(Debug)]
pub struct CheckpointReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Write side of the checkpoint lock.
#[derive(Debug)]
pub struct CheckpointWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl CheckpointLock {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            lock: RwLock::new(()),
            timeout,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the read side.
    ///
    /// # Errors
    /// - [`StoreError::LockTimeout`] if a checkpoint holds the write side past the bound
    pub fn read(&self) -> Result<CheckpointReadGuard<'_>> {
        let guard = self
            .lock
            .try_read_recursive_for(self.timeout)
            .ok_or(StoreError::LockTimeout {
                lock: "checkpoint read lock",
                waited: self.timeout,
            })?;
        Ok(CheckpointReadGuard { _guard: guard })
    }

    /// Acquire the write side, waiting for current readers to drain.
    ///
    /// # Errors
    /// - [`StoreError::LockTimeout`] if readers do not drain within the bound
    pub fn write(&self) -> Result<CheckpointWriteGuard<'_>> {
        let guard = self
            .lock
            .try_write_for(self.timeout)
            .ok_or(StoreError::LockTimeout {
                lock: "checkpoint write lock",
                waited: self.timeout,
            })?;
        Ok(CheckpointWriteGuard { _guard: guard })
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        if self.lock.is_locked_exclusive() {
            LockState::WriteHeld
        } else if self.lock.is_locked() {
            LockState::ReadHeld
        } else {
            LockState::Idle
        }
    }
}

impl Default for CheckpointLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Checkpoint configuration.
#[derive(Debug, Copy, Clone)]
pub struct CheckpointConfig {
    /// Number of mutations between automatic checkpoints.
    /// Set to 0 to disable operation-based checkpoints.
    pub ops_threshold: u64,

    /// Number of dirty pages that triggers an automatic checkpoint.
    /// Set to 0 to disable dirty-page-based checkpoints.
    pub dirty_pages_threshold: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ops_threshold: DEFAULT_OPS_THRESHOLD,
            dirty_pages_threshold: DEFAULT_DIRTY_PAGES_THRESHOLD,
        }
    }
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration.
    #[must_use]
    pub const fn new(ops_threshold: u64, dirty_pages_threshold: u64) -> Self {
        Self {
            ops_threshold,
            dirty_pages_threshold,
        }
    }

    /// Disable automatic checkpoints (manual only).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            ops_threshold: 0,
            dirty_pages_threshold: 0,
        }
    }
}

/// Tracks state needed for checkpoint decisions.
#[derive(Debug)]
pub struct CheckpointState {
    config: CheckpointConfig,

    /// Epoch of the last completed checkpoint, 0 before the first one.
    epoch: u64,

    /// Number of mutations since last checkpoint.
    ops_since_checkpoint: u64,
}

impl CheckpointState {
    #[must_use]
    pub const fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            epoch: 0,
            ops_since_checkpoint: 0,
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub const fn ops_since_checkpoint(&self) -> u64 {
        self.ops_since_checkpoint
    }

    /// Record that a mutation completed.
    pub const fn record_op(&mut self) {
        self.ops_since_checkpoint += 1;
    }

    /// Check if a checkpoint should be triggered.
    #[must_use]
    pub const fn should_checkpoint(&self, dirty_pages: u64) -> bool {
        if self.config.ops_threshold > 0 && self.ops_since_checkpoint >= self.config.ops_threshold
        {
            return true;
        }

        if self.config.dirty_pages_threshold > 0
            && dirty_pages >= self.config.dirty_pages_threshold
        {
            return true;
        }

        false
    }

    const fn complete(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.ops_since_checkpoint = 0;
    }
}

/// Result of a checkpoint operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Epoch assigned to this checkpoint.
    pub epoch: u64,

    /// Number of dirty pages handed to the sink.
    pub pages_written: usize,
}

/// Destination of checkpoint snapshots.
pub trait CheckpointSink: Send {
    /// Start snapshot `epoch`.
    fn begin(&mut self, epoch: u64, page_size: usize) -> Result<()>;

    /// Append one page. Its checksum has already been stamped.
    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()>;

    /// Make snapshot `epoch` durable.
    fn finish(&mut self, epoch: u64) -> Result<()>;
}

/// Sink that discards snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCheckpointSink;

impl CheckpointSink for NullCheckpointSink {
    fn begin(&mut self, _epoch: u64, _page_size: usize) -> Result<()> {
        Ok(())
    }

    fn write_page(&mut self, _page_id: PageId, _page: &Page) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _epoch: u64) -> Result<()> {
        Ok(())
    }
}

/// A snapshot captured by [`MemoryCheckpointSink`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub epoch: u64,
    /// Page ids with the checksum stamped at checkpoint time.
    pub pages: Vec<(PageId, u32)>,
    pub finished: bool,
}

/// Sink keeping page ids and checksums in memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointSink {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl MemoryCheckpointSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().clone()
    }
}

impl CheckpointSink for MemoryCheckpointSink {
    fn begin(&mut self, epoch: u64, _page_size: usize) -> Result<()> {
        self.snapshots.lock().push(Snapshot {
            epoch,
            ..Snapshot::default()
        });
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        if let Some(snapshot) = self.snapshots.lock().last_mut() {
            snapshot.pages.push((page_id, page.checksum()));
        }
        Ok(())
    }

    fn finish(&mut self, _epoch: u64) -> Result<()> {
        if let Some(snapshot) = self.snapshots.lock().last_mut() {
            snapshot.finished = true;
        }
        Ok(())
    }
}

/// Sink appending snapshots to a file.
///
/// Record layout:
/// - begin: `PSCP`, epoch (u64), page size (u32)
/// - page: page id (u64), checksum (u32), page bytes
/// - end: `PEND`, epoch (u64), page count (u32)
///
/// The file is synced at the end of every snapshot.
#[derive(Debug)]
pub struct FileCheckpointSink {
    path: PathBuf,
    writer: BufWriter<File>,
    pages_in_snapshot: u32,
}

impl FileCheckpointSink {
    /// Open (or create) the snapshot file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            pages_in_snapshot: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for FileCheckpointSink {
    #[allow(clippy::cast_possible_truncation)]
    fn begin(&mut self, epoch: u64, page_size: usize) -> Result<()> {
        self.pages_in_snapshot = 0;
        self.writer.write_all(SNAPSHOT_MAGIC)?;
        self.writer.write_all(&epoch.to_le_bytes())?;
        self.writer.write_all(&(page_size as u32).to_le_bytes())?;
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        self.writer.write_all(&page_id.as_raw().to_le_bytes())?;
        self.writer.write_all(&page.checksum().to_le_bytes())?;
        self.writer.write_all(page.as_bytes())?;
        self.pages_in_snapshot += 1;
        Ok(())
    }

    fn finish(&mut self, epoch: u64) -> Result<()> {
        self.writer.write_all(SNAPSHOT_END_MAGIC)?;
        self.writer.write_all(&epoch.to_le_bytes())?;
        self.writer.write_all(&self.pages_in_snapshot.to_le_bytes())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Runs checkpoint passes over a page memory.
pub struct Checkpointer {
    memory: Arc<PageMemory>,
    lock: Arc<CheckpointLock>,
    state: Mutex<CheckpointState>,
    sink: Mutex<Box<dyn CheckpointSink>>,
}

impl Checkpointer {
    #[must_use]
    pub fn new(
        memory: Arc<PageMemory>,
        lock: Arc<CheckpointLock>,
        config: CheckpointConfig,
        sink: Box<dyn CheckpointSink>,
    ) -> Self {
        Self {
            memory,
            lock,
            state: Mutex::new(CheckpointState::new(config)),
            sink: Mutex::new(sink),
        }
    }

    #[must_use]
    pub fn lock(&self) -> &Arc<CheckpointLock> {
        &self.lock
    }

    /// Epoch of the last completed checkpoint.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch()
    }

    /// Record that a mutation completed.
    pub fn record_op(&self) {
        self.state.lock().record_op();
    }

    #[must_use]
    pub fn should_checkpoint(&self) -> bool {
        let dirty = self.memory.dirty_page_count() as u64;
        self.state.lock().should_checkpoint(dirty)
    }

    /// Check if a checkpoint is needed and perform it if so.
    pub fn maybe_checkpoint(&self) -> Result<Option<CheckpointResult>> {
        if self.should_checkpoint() {
            Ok(Some(self.force_checkpoint()?))
        } else {
            Ok(None)
        }
    }

    /// Perform a checkpoint regardless of thresholds.
    ///
    /// # Errors
    /// - [`StoreError::LockTimeout`] if mutators do not drain in time; nothing is written
    /// - Any sink error; dirty flags are left set so the next pass rewrites the pages
    pub fn force_checkpoint(&self) -> Result<CheckpointResult> {
        let mut sink = self.sink.lock();
        let _write = self.lock.write()?;

        let epoch = self.state.lock().epoch() + 1;
        let dirty = self.memory.dirty_pages();

        sink.begin(epoch, self.memory.page_size())?;
        for pinned in &dirty {
            let mut page = pinned.write();
            page.stamp_checksum();
            let page_id = page.page_id();
            sink.write_page(page_id, &page)?;
        }
        sink.finish(epoch)?;

        for pinned in &dirty {
            pinned.clear_dirty();
        }
        self.state.lock().complete(epoch);

        let pages_written = dirty.len();
        self.memory
            .stats()
            .checkpoint_completed(pages_written as u64);
        tracing::info!(epoch, pages_written, "checkpoint finished");

        Ok(CheckpointResult {
            epoch,
            pages_written,
        })
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
