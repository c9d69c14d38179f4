#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Soak workload: concurrent writers grow and shrink the engine while the
// maintenance task expires rows and checkpoints in the background.
use std::sync::Arc;
use std::time::{Duration, Instant};

use pagestore::cache::{CacheKey, Engine, MaintenanceConfig, spawn_maintenance_task};
use pagestore::config::EngineConfig;
use pagestore::metrics::CounterIoStats;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Number of writer threads.
const SOAK_THREADS: usize = 8;
/// Operations issued by each writer.
const SOAK_OPS_PER_THREAD: usize = 25_000;
/// Row count writers grow towards before they start shrinking.
const HIGH_WATER: u64 = 20_000;
/// Row count writers shrink towards before they grow again.
const LOW_WATER: u64 = 1_000;
/// Distinct keys per writer.
const KEYS_PER_THREAD: usize = 10_000;

#[derive(Debug, Default, Clone, Copy)]
struct WorkerReport {
    puts: u64,
    removes: u64,
    hits: u64,
    misses: u64,
    failures: u64,
}

/// Run one writer: grow the engine until `HIGH_WATER` rows, then shrink it
/// to `LOW_WATER`, for `SOAK_OPS_PER_THREAD` operations.
#[allow(clippy::cast_possible_truncation)]
fn run_writer(engine: &Engine, worker: usize) -> WorkerReport {
    let mut rng = rand::rng();
    let mut report = WorkerReport::default();
    let mut growing = true;
    let cache_id = worker as u32;

    for _ in 0..SOAK_OPS_PER_THREAD {
        let size = engine.size();
        if growing && size >= HIGH_WATER {
            growing = false;
        } else if !growing && size <= LOW_WATER {
            growing = true;
        }

        let key = CacheKey::new(format!(
            "w{worker}-k{}",
            rng.random_range(0..KEYS_PER_THREAD)
        ));
        let roll = rng.random_range(0..100);
        let result = if (growing && roll < 70) || (!growing && roll < 25) {
            let len = rng.random_range(8..2_048);
            let ttl = rng
                .random_bool(0.2)
                .then(|| Duration::from_millis(rng.random_range(50..2_000)));
            report.puts += 1;
            engine.put(cache_id, &key, vec![worker as u8; len], ttl).map(|_| ())
        } else if roll < 85 {
            engine.get(cache_id, &key).map(|row| {
                if row.is_some() {
                    report.hits += 1;
                } else {
                    report.misses += 1;
                }
            })
        } else {
            report.removes += 1;
            engine.remove(cache_id, &key).map(|_| ())
        };

        if let Err(err) = result {
            report.failures += 1;
            if err.is_corruption() {
                tracing::error!(worker, %err, "structure corruption");
            } else {
                tracing::warn!(worker, %err, "operation failed");
            }
        }
    }
    report
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagestore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: page_size={}, partitions={}, max_pages={}",
        config.page_size,
        config.partitions,
        config.max_pages
    );

    let stats = CounterIoStats::new();
    let maintenance = MaintenanceConfig::from(&config);
    let engine = match Engine::from_config(config, Arc::clone(&stats) as _) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to start engine: {e}");
            std::process::exit(1);
        }
    };
    let task = spawn_maintenance_task(Arc::downgrade(&engine), engine.notifier(), maintenance);

    let started = Instant::now();
    let writers: Vec<_> = (0..SOAK_THREADS)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || run_writer(&engine, worker))
        })
        .collect();

    let mut total = WorkerReport::default();
    for writer in writers {
        match writer.await {
            Ok(report) => {
                total.puts += report.puts;
                total.removes += report.removes;
                total.hits += report.hits;
                total.misses += report.misses;
                total.failures += report.failures;
            }
            Err(e) => tracing::error!("Writer panicked: {e}"),
        }
    }
    tracing::info!(elapsed = ?started.elapsed(), ?total, rows = engine.size(), "workload finished");

    match engine.checkpoint() {
        Ok(result) => tracing::info!(
            epoch = result.epoch,
            pages_written = result.pages_written,
            "final checkpoint"
        ),
        Err(e) => tracing::error!("Final checkpoint failed: {e}"),
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        live_rows = snapshot.live_rows(),
        pages_allocated = snapshot.pages_allocated,
        pages_recycled = snapshot.pages_recycled,
        pages_reused = snapshot.pages_reused,
        checkpoints = snapshot.checkpoints,
        allocated_now = engine.memory().allocated_pages(),
        "io statistics"
    );

    drop(engine);
    if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
        tracing::warn!("Maintenance task did not stop in time");
    }
}
