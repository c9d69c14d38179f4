//! Page-oriented storage core: a bucketed free-list allocator for
//! variable-length rows, a B+-tree engine over page memory, per-partition
//! page reuse, a checkpoint lock and a partitioned cache with expiration.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use cache::{CacheKey, CacheRow, Engine};
pub use config::{ConfigError, EngineConfig};
pub use error::{Result, StoreError};
