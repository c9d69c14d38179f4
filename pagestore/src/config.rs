//! Engine configuration module.
//!
//! This module provides configuration loading for the page store engine from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `PAGESTORE_PAGE_SIZE`: Page size in bytes, a power of two in 1024..=16384 (default: `4096`)
//! - `PAGESTORE_PARTITIONS`: Number of partitions, 1..=65535 (default: `16`)
//! - `PAGESTORE_MAX_PAGES`: Page memory capacity in pages (default: `262144`)
//! - `PAGESTORE_CHECKPOINT_TIMEOUT_MS`: Bound on checkpoint lock acquisition (default: `10000`)
//! - `PAGESTORE_CHECKPOINT_OPS`: Mutations between checkpoints, 0 disables (default: `10000`)
//! - `PAGESTORE_CHECKPOINT_DIRTY_PAGES`: Dirty pages triggering a checkpoint, 0 disables (default: `4096`)
//! - `PAGESTORE_EXPIRY_BATCH`: Rows expired per maintenance tick (default: `500`)
//! - `PAGESTORE_EXPIRY_INTERVAL_MS`: Maintenance tick interval (default: `1000`)
//! - `PAGESTORE_TOMBSTONE_TTL_MS`: Lifetime of removal tombstones, 0 removes immediately (default: `60000`)
//! - `PAGESTORE_CHECKPOINT_PATH`: File receiving checkpoint snapshots (default: none)
//!
//! # Invariants
//!
//! - `page_size` is always a supported page size
//! - `partitions` and `max_pages` are always non-zero

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::checkpoint::{self, CheckpointConfig};
use crate::storage::memory::DEFAULT_MAX_PAGES;
use crate::storage::page::{DEFAULT_PAGE_SIZE, is_valid_page_size};

/// Engine configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()` or `default()`:
/// - `page_size` is a power of two in 1024..=16384
/// - `partitions` >= 1 and `max_pages` >= 1
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of every page in bytes.
    pub page_size: usize,
    /// Number of partitions keys are spread over.
    pub partitions: u16,
    /// Page memory capacity in pages.
    pub max_pages: u64,
    /// How long a checkpoint waits for mutators to drain, and mutators for a checkpoint.
    pub checkpoint_timeout: Duration,
    /// Thresholds for automatic checkpoints.
    pub checkpoint: CheckpointConfig,
    /// Maximum number of rows expired per maintenance tick.
    pub expiry_batch: usize,
    /// Interval between maintenance ticks.
    pub expiry_interval: Duration,
    /// Lifetime of tombstones written by removals. Zero removes rows immediately.
    pub tombstone_ttl: Duration,
    /// Optional file receiving checkpoint snapshots.
    pub checkpoint_path: Option<PathBuf>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            partitions: Self::DEFAULT_PARTITIONS,
            max_pages: DEFAULT_MAX_PAGES,
            checkpoint_timeout: checkpoint::DEFAULT_LOCK_TIMEOUT,
            checkpoint: CheckpointConfig::default(),
            expiry_batch: Self::DEFAULT_EXPIRY_BATCH,
            expiry_interval: Self::DEFAULT_EXPIRY_INTERVAL,
            tombstone_ttl: Self::DEFAULT_TOMBSTONE_TTL,
            checkpoint_path: None,
        }
    }
}

impl EngineConfig {
    /// Default number of partitions.
    pub const DEFAULT_PARTITIONS: u16 = 16;
    /// Default number of rows expired per maintenance tick.
    pub const DEFAULT_EXPIRY_BATCH: usize = 500;
    /// Default interval between maintenance ticks.
    pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);
    /// Default tombstone lifetime.
    pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(60);

    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables take their default.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let page_size = Self::load_page_size()?;
        let partitions = Self::load_partitions()?;
        let max_pages = load_var("PAGESTORE_MAX_PAGES", defaults.max_pages)?;
        if max_pages == 0 {
            return Err(invalid("PAGESTORE_MAX_PAGES", "must be at least 1"));
        }

        let checkpoint_timeout = load_duration_ms(
            "PAGESTORE_CHECKPOINT_TIMEOUT_MS",
            defaults.checkpoint_timeout,
        )?;
        let checkpoint = CheckpointConfig::new(
            load_var("PAGESTORE_CHECKPOINT_OPS", defaults.checkpoint.ops_threshold)?,
            load_var(
                "PAGESTORE_CHECKPOINT_DIRTY_PAGES",
                defaults.checkpoint.dirty_pages_threshold,
            )?,
        );

        Ok(Self {
            page_size,
            partitions,
            max_pages,
            checkpoint_timeout,
            checkpoint,
            expiry_batch: load_var("PAGESTORE_EXPIRY_BATCH", defaults.expiry_batch)?,
            expiry_interval: load_duration_ms(
                "PAGESTORE_EXPIRY_INTERVAL_MS",
                defaults.expiry_interval,
            )?,
            tombstone_ttl: load_duration_ms("PAGESTORE_TOMBSTONE_TTL_MS", defaults.tombstone_ttl)?,
            checkpoint_path: std::env::var("PAGESTORE_CHECKPOINT_PATH")
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Load the page size from environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a supported page size.
    fn load_page_size() -> Result<usize, ConfigError> {
        let page_size = load_var("PAGESTORE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if !is_valid_page_size(page_size) {
            return Err(invalid(
                "PAGESTORE_PAGE_SIZE",
                format!("{page_size} is not a power of two between 1024 and 16384"),
            ));
        }
        Ok(page_size)
    }

    /// Load the partition count from environment.
    fn load_partitions() -> Result<u16, ConfigError> {
        let partitions = load_var("PAGESTORE_PARTITIONS", Self::DEFAULT_PARTITIONS)?;
        if partitions == 0 {
            return Err(invalid("PAGESTORE_PARTITIONS", "must be at least 1"));
        }
        Ok(partitions)
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_partitions(mut self, partitions: u16) -> Self {
        self.partitions = partitions;
        self
    }

    #[must_use]
    pub const fn with_max_pages(mut self, max_pages: u64) -> Self {
        self.max_pages = max_pages;
        self
    }

    #[must_use]
    pub const fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    #[must_use]
    pub const fn with_tombstone_ttl(mut self, tombstone_ttl: Duration) -> Self {
        self.tombstone_ttl = tombstone_ttl;
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, batch: usize, interval: Duration) -> Self {
        self.expiry_batch = batch;
        self.expiry_interval = interval;
        self
    }
}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Parse `name` if set, `default` otherwise.
fn load_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(name, format!("'{value}' is not a valid number"))),
        Err(_) => Ok(default),
    }
}

fn load_duration_ms(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    load_var(name, default_ms).map(Duration::from_millis)
}
