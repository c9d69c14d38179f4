//! Error taxonomy for the storage core.
//!
//! Every fallible operation in the crate returns [`StoreError`]. Corruption
//! variants are always surfaced to the caller and never masked by a partial or
//! empty result.

use std::time::Duration;

use thiserror::Error;

use crate::storage::{Link, PageId};

/// Result alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors returned by page memory, the free list, the trees and the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No page could be obtained from the reuse list or page memory.
    #[error("out of page memory: {allocated} of {limit} pages in use")]
    OutOfMemory { allocated: u64, limit: u64 },

    /// The page identifier is not currently allocated.
    #[error("page not found: {0}")]
    PageNotFound(PageId),

    /// The link does not address a live row head.
    #[error("invalid link: {0}")]
    InvalidLink(Link),

    /// Fragment chain lengths disagree with the length recorded in the head.
    #[error("fragment length mismatch for {link}: expected {expected} bytes, found {actual}")]
    FragmentLengthMismatch {
        link: Link,
        expected: usize,
        actual: usize,
    },

    /// The page graph is inconsistent (wrong page type, foreign owner, broken chain).
    #[error("structure corruption at page {page}: {reason}")]
    StructureCorruption { page: PageId, reason: String },

    /// A checkpoint or page lock was not acquired within the bound.
    #[error("timed out after {waited:?} acquiring {lock}")]
    LockTimeout { lock: &'static str, waited: Duration },

    /// Stored bytes could not be decoded into a row.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// I/O failure while writing a checkpoint snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Build a [`StoreError::StructureCorruption`] for `page`.
    pub fn corruption(page: PageId, reason: impl Into<String>) -> Self {
        Self::StructureCorruption {
            page,
            reason: reason.into(),
        }
    }

    /// Whether this error signals that on-page structures are inconsistent.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::StructureCorruption { .. } | Self::FragmentLengthMismatch { .. }
        )
    }
}
