//! Tree rows of the partition indexes.
//!
//! [`DataRow`] indexes stored rows by `(cache_id, key hash, link)`; rows
//! whose keys collide on the hash are told apart by reading their payload.
//! [`PendingRow`] indexes rows that carry an expiration time by
//! `(expire_time, cache_id, link)`, the link keeping the order total.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::storage::{Link, TreeRow};

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

/// Hash of a key's bytes as recorded in the data tree.
#[must_use]
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Data tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRow {
    pub cache_id: u32,
    pub hash: u32,
    pub link: Link,
}

impl DataRow {
    /// Smallest entry for `(cache_id, hash)`.
    #[must_use]
    pub const fn lower(cache_id: u32, hash: u32) -> Self {
        Self {
            cache_id,
            hash,
            link: Link::NONE,
        }
    }

    /// Largest entry for `(cache_id, hash)`.
    #[must_use]
    pub const fn upper(cache_id: u32, hash: u32) -> Self {
        Self {
            cache_id,
            hash,
            link: Link::from_raw(u64::MAX),
        }
    }
}

impl TreeRow for DataRow {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.cache_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.hash.to_le_bytes());
        out[8..16].copy_from_slice(&self.link.as_raw().to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            cache_id: read_u32(&bytes[0..4]),
            hash: read_u32(&bytes[4..8]),
            link: Link::from_raw(read_u64(&bytes[8..16])),
        }
    }
}

/// Pending-expiration tree entry.
///
/// Ordering, equality and hashing only consider `(expire_time, cache_id, link)`.
#[derive(Debug, Clone, Copy)]
pub struct PendingRow {
    pub expire_time: u64,
    pub cache_id: u32,
    pub link: Link,
    /// Hash of the row's key, locating its data tree entry.
    pub key_hash: u32,
    pub tombstone: bool,
}

impl PendingRow {
    /// Largest entry expiring at or before `now_ms`.
    #[must_use]
    pub const fn upper_bound(now_ms: u64) -> Self {
        Self {
            expire_time: now_ms,
            cache_id: u32::MAX,
            link: Link::from_raw(u64::MAX),
            key_hash: 0,
            tombstone: false,
        }
    }

    /// Partition the row is stored in.
    #[must_use]
    pub const fn partition(&self) -> u16 {
        self.link.page_id().partition()
    }

    /// Data tree entry of the row.
    #[must_use]
    pub const fn data_row(&self) -> DataRow {
        DataRow {
            cache_id: self.cache_id,
            hash: self.key_hash,
            link: self.link,
        }
    }

    const fn sort_key(&self) -> (u64, u32, Link) {
        (self.expire_time, self.cache_id, self.link)
    }
}

impl PartialEq for PendingRow {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for PendingRow {}

impl PartialOrd for PendingRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRow {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Hash for PendingRow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl TreeRow for PendingRow {
    const SIZE: usize = 25;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.expire_time.to_le_bytes());
        out[8..12].copy_from_slice(&self.cache_id.to_le_bytes());
        out[12..20].copy_from_slice(&self.link.as_raw().to_le_bytes());
        out[20..24].copy_from_slice(&self.key_hash.to_le_bytes());
        out[24] = u8::from(self.tombstone);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            expire_time: read_u64(&bytes[0..8]),
            cache_id: read_u32(&bytes[8..12]),
            link: Link::from_raw(read_u64(&bytes[12..20])),
            key_hash: read_u32(&bytes[20..24]),
            tombstone: bytes[24] != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageFlag, PageId};

    fn link(partition: u16, index: u32, item: u8) -> Link {
        Link::new(PageId::new(partition, index, PageFlag::Data), item)
    }

    fn pending(expire_time: u64, cache_id: u32, link: Link) -> PendingRow {
        PendingRow {
            expire_time,
            cache_id,
            link,
            key_hash: 0,
            tombstone: false,
        }
    }

    #[test]
    fn test_data_row_codec() {
        let row = DataRow {
            cache_id: 3,
            hash: 0xDEAD_BEEF,
            link: link(2, 9, 4),
        };
        let mut buf = [0u8; DataRow::SIZE];
        row.encode(&mut buf);
        assert_eq!(DataRow::decode(&buf), row);
    }

    #[test]
    fn test_data_row_bounds_cover_every_link() {
        let row = DataRow {
            cache_id: 1,
            hash: 5,
            link: link(65_535, u32::MAX, 255),
        };
        assert!(DataRow::lower(1, 5) < row);
        assert!(row <= DataRow::upper(1, 5));
        assert!(DataRow::upper(1, 5) < DataRow::lower(1, 6));
    }

    #[test]
    fn test_pending_row_codec_keeps_payload_fields() {
        let row = PendingRow {
            expire_time: 1_700_000_000_000,
            cache_id: 8,
            link: link(4, 100, 7),
            key_hash: 42,
            tombstone: true,
        };
        let mut buf = [0u8; PendingRow::SIZE];
        row.encode(&mut buf);
        let decoded = PendingRow::decode(&buf);
        assert_eq!(decoded, row);
        assert_eq!(decoded.key_hash, 42);
        assert!(decoded.tombstone);
        assert_eq!(decoded.partition(), 4);
    }

    #[test]
    fn test_pending_order_is_total() {
        let a = pending(10, 1, link(0, 1, 0));
        let b = pending(10, 1, link(0, 1, 1));
        let c = pending(10, 2, link(0, 1, 0));
        let d = pending(11, 0, link(0, 0, 0));
        assert!(a < b && b < c && c < d);
        assert!(d <= PendingRow::upper_bound(11));
        assert!(PendingRow::upper_bound(10) < d);

        // Payload fields do not take part in ordering.
        let mut tombstone = a;
        tombstone.tombstone = true;
        tombstone.key_hash = 99;
        assert_eq!(tombstone, a);
    }
}
