//! Key-to-partition mapping.
//!
//! A key is mapped to a partition by hashing its affinity bytes. By default
//! those are the full key bytes; a [`CacheKey`] may declare a separate
//! affinity field so that related keys are colocated in one partition.

use std::fmt;

/// A cache key with an optional affinity field.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    bytes: Vec<u8>,
    affinity: Option<Vec<u8>>,
}

impl CacheKey {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            affinity: None,
        }
    }

    /// A key whose partition is chosen by `affinity` rather than by its bytes.
    #[must_use]
    pub fn with_affinity(bytes: impl Into<Vec<u8>>, affinity: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            affinity: Some(affinity.into()),
        }
    }

    /// Full key bytes, as stored in the row.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes that determine the partition.
    #[must_use]
    pub fn affinity_bytes(&self) -> &[u8] {
        self.affinity.as_deref().unwrap_or(&self.bytes)
    }

    #[must_use]
    pub const fn has_affinity(&self) -> bool {
        self.affinity.is_some()
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key.as_bytes())
    }
}

impl From<&[u8]> for CacheKey {
    fn from(key: &[u8]) -> Self {
        Self::new(key)
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(key: Vec<u8>) -> Self {
        Self::new(key)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CacheKey");
        debug.field("bytes", &String::from_utf8_lossy(&self.bytes));
        if let Some(affinity) = &self.affinity {
            debug.field("affinity", &String::from_utf8_lossy(affinity));
        }
        debug.finish()
    }
}

/// Maps keys onto a fixed number of partitions.
#[derive(Debug, Clone, Copy)]
pub struct AffinityFunction {
    partitions: u16,
}

impl AffinityFunction {
    /// # Pre-conditions
    /// - `partitions` > 0
    #[must_use]
    pub const fn new(partitions: u16) -> Self {
        debug_assert!(partitions > 0);
        Self { partitions }
    }

    #[must_use]
    pub const fn partitions(&self) -> u16 {
        self.partitions
    }

    /// Partition owning `key`.
    #[must_use]
    pub fn partition(&self, key: &CacheKey) -> u16 {
        self.partition_of_bytes(key.affinity_bytes())
    }

    /// Partition a raw byte string hashes to.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn partition_of_bytes(&self, bytes: &[u8]) -> u16 {
        (crc32fast::hash(bytes) % u32::from(self.partitions)) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_stable_and_in_range() {
        let affinity = AffinityFunction::new(16);
        for i in 0..1000 {
            let key = CacheKey::new(format!("key-{i}"));
            let partition = affinity.partition(&key);
            assert!(partition < 16);
            assert_eq!(partition, affinity.partition(&key));
        }
    }

    #[test]
    fn test_affinity_field_overrides_key_bytes() {
        let affinity = AffinityFunction::new(32);
        let key = CacheKey::with_affinity("order:77", "customer:5");
        assert_eq!(key.bytes(), b"order:77");
        assert_eq!(
            affinity.partition(&key),
            affinity.partition_of_bytes(b"customer:5")
        );
        assert!(key.has_affinity());
    }

    #[test]
    fn test_colocated_keys_share_partition() {
        let affinity = AffinityFunction::new(64);
        let partitions: Vec<u16> = (0..50)
            .map(|i| affinity.partition(&CacheKey::with_affinity(format!("line:{i}"), "order:1")))
            .collect();
        assert!(partitions.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_single_partition() {
        let affinity = AffinityFunction::new(1);
        assert_eq!(affinity.partition(&CacheKey::from("anything")), 0);
    }
}
