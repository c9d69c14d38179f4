//! Page identifiers, links and the raw page buffer.
//!
//! Pages are fixed-size byte blocks whose size is chosen when the page memory
//! is created (1 KiB to 16 KiB, always a power of two). Every page starts with
//! a [`PageHeader`]; the remainder is interpreted by the owner of the page
//! (free list, tree or reuse list) according to [`PageType`].
//!
//! # Identifier layout
//!
//! ```text
//! PageId (u64):  [ unused:8 | flag:8 | partition:16 | index:32 ]
//! Link   (u64):  [ item:8   | flag:8 | partition:16 | index:32 ]
//! ```
//!
//! A link is a page identifier with the item slot packed into the top byte,
//! so a link is never a native address. Page index 0 is never allocated, which
//! makes the all-zero value a safe "none" for both types.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 16384;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const PARTITION_SHIFT: u32 = 32;
const FLAG_SHIFT: u32 = 48;
const PAGE_ID_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
const ITEM_SHIFT: u32 = 56;

/// Allocation flag carried inside a [`PageId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageFlag {
    /// Page holds row data.
    Data = 1,
    /// Page holds index structures (tree nodes, tree meta).
    Index = 2,
}

impl TryFrom<u8> for PageFlag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Data),
            2 => Ok(Self::Index),
            _ => Err(value),
        }
    }
}

/// Identifier of a page: flag, partition and page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PageId(u64);

impl PageId {
    /// The "no page" sentinel.
    pub const NONE: Self = Self(0);

    /// Compose a page identifier.
    #[must_use]
    pub const fn new(partition: u16, index: u32, flag: PageFlag) -> Self {
        Self(
            ((flag as u64) << FLAG_SHIFT)
                | ((partition as u64) << PARTITION_SHIFT)
                | index as u64,
        )
    }

    /// Rebuild a page identifier from its raw encoding. The item byte, if any, is discarded.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & PAGE_ID_MASK)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn partition(self) -> u16 {
        (self.0 >> PARTITION_SHIFT) as u16
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// Raw flag byte.
    #[must_use]
    pub const fn flag_bits(self) -> u8 {
        (self.0 >> FLAG_SHIFT) as u8
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Same page, different allocation flag. Used when a recycled page changes role.
    #[must_use]
    pub const fn with_flag(self, flag: PageFlag) -> Self {
        Self::new(self.partition(), self.index(), flag)
    }

    /// Key identifying the physical page regardless of its current flag.
    #[must_use]
    pub const fn effective(self) -> u64 {
        self.0 & ((0xFFFF_u64 << PARTITION_SHIFT) | INDEX_MASK)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match PageFlag::try_from(self.flag_bits()) {
            Ok(PageFlag::Data) => "data",
            Ok(PageFlag::Index) => "idx",
            Err(_) => "?",
        };
        write!(f, "{}:{}:{flag}", self.partition(), self.index())
    }
}

/// Opaque locator of a stored row or fragment: page identifier plus item slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Link(u64);

impl Link {
    /// The "no link" sentinel.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(page_id: PageId, item: u8) -> Self {
        Self(((item as u64) << ITEM_SHIFT) | page_id.as_raw())
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn page_id(self) -> PageId {
        PageId::from_raw(self.0)
    }

    #[must_use]
    pub const fn item(self) -> u8 {
        (self.0 >> ITEM_SHIFT) as u8
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.page_id(), self.item())
    }
}

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Freshly allocated, never formatted.
    Fresh = 0x00,
    /// Slotted data page owned by a free list.
    Data = 0x01,
    /// Tree meta page (root, height, size).
    BTreeMeta = 0x02,
    /// Tree inner node.
    BTreeInner = 0x03,
    /// Tree leaf node.
    BTreeLeaf = 0x04,
    /// Page parked on a reuse list.
    Reuse = 0x05,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Fresh),
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::BTreeMeta),
            0x03 => Ok(Self::BTreeInner),
            0x04 => Ok(Self::BTreeLeaf),
            0x05 => Ok(Self::Reuse),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - reserved: 3 bytes
/// - `checksum`: 4 bytes (CRC32, stamped at checkpoint time)
/// - `page_id`: 8 bytes
/// - `generation`: 4 bytes, bumped every time the page is recycled
/// - `owner`: 4 bytes, tree id for tree pages, 0 otherwise
///
/// Total: 24 bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub checksum: u32,
    pub page_id: PageId,
    pub generation: u32,
    pub owner: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 24;

    const CHECKSUM_OFFSET: usize = 4;
    const PAGE_ID_OFFSET: usize = 8;
    const GENERATION_OFFSET: usize = 16;
    const OWNER_OFFSET: usize = 20;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.page_id.as_raw().to_le_bytes());
        buf[16..20].copy_from_slice(&self.generation.to_le_bytes());
        buf[20..24].copy_from_slice(&self.owner.to_le_bytes());
        buf
    }
}

/// A raw page buffer.
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a new zeroed page of `page_size` bytes.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    /// Page size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Raw page type byte, which may not name a known [`PageType`].
    #[must_use]
    pub fn page_type_raw(&self) -> u8 {
        self.data[0]
    }

    /// Decoded page type, `None` when the byte is unknown.
    #[must_use]
    pub fn page_type(&self) -> Option<PageType> {
        PageType::try_from(self.data[0]).ok()
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[0] = page_type as u8;
    }

    /// Page identifier recorded in the header.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        PageId::from_raw(self.read_u64(PageHeader::PAGE_ID_OFFSET))
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.read_u32(PageHeader::GENERATION_OFFSET)
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.write_u32(PageHeader::GENERATION_OFFSET, generation);
    }

    #[must_use]
    pub fn owner(&self) -> u32 {
        self.read_u32(PageHeader::OWNER_OFFSET)
    }

    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.read_u32(PageHeader::CHECKSUM_OFFSET)
    }

    /// Decode the common header.
    pub fn header(&self) -> Result<PageHeader, u8> {
        let page_type = PageType::try_from(self.data[0])?;
        Ok(PageHeader {
            page_type,
            checksum: self.checksum(),
            page_id: self.page_id(),
            generation: self.generation(),
            owner: self.owner(),
        })
    }

    /// Write the common header.
    pub fn set_header(&mut self, header: &PageHeader) {
        self.write_bytes(0, &header.to_bytes());
    }

    /// Wipe the page and give it a new role.
    ///
    /// The generation is preserved: it is only ever advanced by the reuse list,
    /// so cursors that remembered the previous generation notice the change.
    pub fn format(&mut self, page_id: PageId, page_type: PageType, owner: u32) {
        let generation = self.generation();
        self.data.fill(0);
        self.set_header(&PageHeader {
            page_type,
            checksum: 0,
            page_id,
            generation,
            owner,
        });
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..PageHeader::CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.data[PageHeader::CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    /// Compute and store the checksum, returning it.
    pub fn stamp_checksum(&mut self) -> u32 {
        let checksum = self.compute_checksum();
        self.write_u32(PageHeader::CHECKSUM_OFFSET, checksum);
        checksum
    }

    /// Whether the stored checksum matches the content.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum() == self.compute_checksum()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("first_24_bytes", &&self.data[..PageHeader::SIZE])
            .finish_non_exhaustive()
    }
}

/// Whether `page_size` is a supported page size.
#[must_use]
pub const fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE && page_size <= MAX_PAGE_SIZE
}
