//! Partitioned cache built on the storage core.
//!
//! Rows are routed to a [`PartitionStore`] by the [`AffinityFunction`]; the
//! [`Engine`] ties the partitions to one page memory, one checkpointer and
//! one [`ExpirationQueue`].

pub mod affinity;
pub mod engine;
pub mod expiry;
pub mod partition;
pub mod row;
pub mod rows;
pub mod worker;

pub use affinity::{AffinityFunction, CacheKey};
pub use engine::{Engine, ExpireResult};
pub use expiry::ExpirationQueue;
pub use partition::PartitionStore;
pub use row::CacheRow;
pub use rows::{DataRow, PendingRow};
pub use worker::{MaintenanceConfig, spawn_maintenance_task};
