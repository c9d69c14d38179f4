//! Cache row codec.
//!
//! Row layout (little-endian):
//! - `flags`: 1 byte (bit 0: tombstone)
//! - `cache_id`: 4 bytes
//! - `version`: 8 bytes
//! - `expire_time`: 8 bytes (milliseconds since epoch, 0 = never)
//! - `key_len`: 4 bytes, then the key
//! - `value_len`: 4 bytes, then the value
//!
//! Total header: 29 bytes

use crate::error::{Result, StoreError};
use crate::storage::Payload;

const FLAG_TOMBSTONE: u8 = 0x01;

/// Fixed part of an encoded row.
pub const ROW_HEADER_SIZE: usize = 29;

/// A logical key/value row stored by a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub cache_id: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    /// Expiration time in milliseconds since epoch, 0 if the row never expires.
    pub expire_time: u64,
    pub tombstone: bool,
}

impl CacheRow {
    #[must_use]
    pub fn new(cache_id: u32, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            cache_id,
            key: key.into(),
            value: value.into(),
            version: 0,
            expire_time: 0,
            tombstone: false,
        }
    }

    /// A tombstone marking `key` removed at `version`, reclaimed at `expire_time`.
    #[must_use]
    pub fn tombstone(cache_id: u32, key: impl Into<Vec<u8>>, version: u64, expire_time: u64) -> Self {
        Self {
            cache_id,
            key: key.into(),
            value: Vec::new(),
            version,
            expire_time,
            tombstone: true,
        }
    }

    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn with_expire_time(mut self, expire_time: u64) -> Self {
        self.expire_time = expire_time;
        self
    }

    /// Whether the row carries an expiration time.
    #[must_use]
    pub const fn expires(&self) -> bool {
        self.expire_time != 0
    }

    /// Whether the row is expired at `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        self.expires() && self.expire_time <= now_ms
    }

    /// Decode a row previously encoded with [`Payload::encode_into`].
    ///
    /// # Errors
    /// - [`StoreError::MalformedRow`] if the bytes are truncated or have trailing data
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        let flags = reader.u8()?;
        let cache_id = reader.u32()?;
        let version = reader.u64()?;
        let expire_time = reader.u64()?;
        let key = reader.chunk()?.to_vec();
        let value = reader.chunk()?.to_vec();
        if reader.pos != bytes.len() {
            return Err(StoreError::MalformedRow(format!(
                "{} trailing bytes",
                bytes.len() - reader.pos
            )));
        }

        Ok(Self {
            cache_id,
            key,
            value,
            version,
            expire_time,
            tombstone: flags & FLAG_TOMBSTONE != 0,
        })
    }
}

impl Payload for CacheRow {
    fn encoded_len(&self) -> usize {
        ROW_HEADER_SIZE + self.key.len() + self.value.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(if self.tombstone { FLAG_TOMBSTONE } else { 0 });
        out.extend_from_slice(&self.cache_id.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.expire_time.to_le_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.value);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                StoreError::MalformedRow(format!(
                    "needed {len} bytes at offset {}, row has {}",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn chunk(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
