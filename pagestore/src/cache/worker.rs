//! Background maintenance for the cache engine.
//!
//! The maintenance task runs asynchronously: on every tick it expires a batch
//! of due rows and runs a checkpoint if one of the checkpoint thresholds is
//! met.
//!
//! # Design
//!
//! The task holds a `Weak<Engine>` to prevent reference cycles:
//! - The `Engine` owns the notify signal
//! - The task holds a weak reference to the engine
//! - When the engine is dropped, `Weak::upgrade()` returns `None` and the task exits
//!
//! A tick starts when the engine signals (a checkpoint is due) or when the
//! expiry interval elapses, whichever comes first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::engine::Engine;
use crate::config::EngineConfig;

/// Configuration for the maintenance task.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    /// Maximum number of rows expired per tick.
    pub expiry_batch: usize,
    /// Longest wait between two ticks.
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_batch: EngineConfig::DEFAULT_EXPIRY_BATCH,
            interval: EngineConfig::DEFAULT_EXPIRY_INTERVAL,
        }
    }
}

impl From<&EngineConfig> for MaintenanceConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            expiry_batch: config.expiry_batch,
            interval: config.expiry_interval,
        }
    }
}

/// Spawn the maintenance task for an engine.
///
/// # Invariants
/// - Expires at most `config.expiry_batch` rows per tick
/// - Exits cleanly when the engine is dropped
pub fn spawn_maintenance_task(
    engine: Weak<Engine>,
    notify: Arc<Notify>,
    config: MaintenanceConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        maintenance_loop(engine, notify, config).await;
    })
}

async fn maintenance_loop(engine: Weak<Engine>, notify: Arc<Notify>, config: MaintenanceConfig) {
    tracing::info!(
        batch = config.expiry_batch,
        interval_ms = config.interval.as_millis(),
        "maintenance task started"
    );
    loop {
        tokio::select! {
            () = notify.notified() => {}
            () = tokio::time::sleep(config.interval) => {}
        }

        let Some(engine_arc) = engine.upgrade() else {
            break;
        };

        match engine_arc.expire(engine_arc.now_ms(), config.expiry_batch) {
            Ok(result) => {
                // More rows are queued than one batch covers: go again right away.
                if result.remaining > 0 && result.expired > 0 {
                    notify.notify_one();
                }
            }
            Err(err) => tracing::error!(%err, "expiry pass failed"),
        }

        if let Err(err) = engine_arc.maybe_checkpoint() {
            tracing::warn!(%err, "checkpoint failed");
        }
    }
    tracing::info!("maintenance task stopped");
}
