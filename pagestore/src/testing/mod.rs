//! Shared fixtures for unit and end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Engine, PartitionStore};
use crate::config::EngineConfig;
use crate::metrics::NoopIoStats;
use crate::storage::checkpoint::{CheckpointConfig, CheckpointLock, NullCheckpointSink};
use crate::storage::page::MIN_PAGE_SIZE;
use crate::storage::{ManualTimeSource, PageMemory, ReuseList};

/// Clock reading of every fixture engine at creation.
pub const START_MS: u64 = 1_000_000;

/// Small engine configuration: 1 KiB pages, 4 partitions, no automatic checkpoints.
#[must_use]
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_page_size(MIN_PAGE_SIZE)
        .with_partitions(4)
        .with_max_pages(16_384)
        .with_checkpoint(CheckpointConfig::disabled())
        .with_tombstone_ttl(Duration::from_secs(60))
}

/// Engine on a manual clock set to [`START_MS`].
pub fn test_engine(config: EngineConfig) -> (Arc<Engine>, Arc<ManualTimeSource>) {
    let clock = Arc::new(ManualTimeSource::new(START_MS));
    let engine = Engine::new(
        config,
        Arc::clone(&clock) as Arc<dyn crate::storage::TimeSource>,
        Arc::new(NoopIoStats),
        Box::new(NullCheckpointSink),
    )
    .expect("create test engine");
    (engine, clock)
}

/// Page memory reporting nothing.
#[must_use]
pub fn test_memory(page_size: usize, max_pages: u64) -> Arc<PageMemory> {
    PageMemory::new(page_size, max_pages, Arc::new(NoopIoStats))
}

/// Partition store over a fresh page memory.
#[must_use]
pub fn test_partition(page_size: usize, max_pages: u64, partition: u16) -> PartitionStore {
    PartitionStore::create(
        ReuseList::new(test_memory(page_size, max_pages), partition),
        Arc::new(CheckpointLock::default()),
    )
    .expect("create test partition")
}
