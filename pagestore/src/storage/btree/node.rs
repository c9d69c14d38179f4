//! B+-tree node types and serialization.
//!
//! Node header layout (after the common page header):
//! - `level`: 2 bytes (0 for leaves)
//! - `count`: 2 bytes (rows in a leaf, keys in an inner node)
//! - `forward`: 8 bytes (next leaf to the right, 0 if none; unused in inner nodes)
//! - reserved: 4 bytes
//!
//! Total: 16 bytes
//!
//! Leaves store `count` fixed-size rows. Inner nodes store a first child
//! pointer followed by `count` `(key, child)` pairs.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::error::{Result, StoreError};
use crate::storage::page::{Page, PageHeader, PageId, PageType};

const LEVEL_OFFSET: usize = PageHeader::SIZE;
const COUNT_OFFSET: usize = PageHeader::SIZE + 2;
const FORWARD_OFFSET: usize = PageHeader::SIZE + 4;

/// Offset where node data starts (after page header + node header).
pub const DATA_OFFSET: usize = PageHeader::SIZE + 16;

const CHILD_SIZE: usize = 8;

const META_ROOT_OFFSET: usize = PageHeader::SIZE;
const META_HEIGHT_OFFSET: usize = PageHeader::SIZE + 8;
const META_SIZE_OFFSET: usize = PageHeader::SIZE + 16;

/// A fixed-size, totally ordered tree row.
///
/// The `Ord` implementation is the tree's comparator. Rows that compare
/// equal are the same key: [`put`](super::BPlusTree::put) replaces them.
pub trait TreeRow: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Write the row into `out`, which is exactly `SIZE` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Read a row from `bytes`, which is exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

impl TreeRow for u64 {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Self::from_be_bytes(buf)
    }
}

/// Maximum number of rows in a leaf.
#[must_use]
pub const fn leaf_capacity(page_size: usize, row_size: usize) -> usize {
    (page_size - DATA_OFFSET) / row_size
}

/// Maximum number of keys in an inner node.
#[must_use]
pub const fn inner_capacity(page_size: usize, row_size: usize) -> usize {
    (page_size - DATA_OFFSET - CHILD_SIZE) / (row_size + CHILD_SIZE)
}

fn check_node(page: &Page, expected: PageType, owner: u32) -> Result<()> {
    let actual = page.page_type();
    if actual != Some(expected) {
        return Err(StoreError::corruption(
            page.page_id(),
            format!("expected {expected:?} page, found {actual:?}"),
        ));
    }
    if page.owner() != owner {
        return Err(StoreError::corruption(
            page.page_id(),
            format!("page belongs to tree {}, not {owner}", page.owner()),
        ));
    }
    Ok(())
}

/// A leaf node: rows in ascending order plus the link to the next leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode<R> {
    pub rows: Vec<R>,
    pub forward: PageId,
}

impl<R: TreeRow> LeafNode<R> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            rows: Vec::new(),
            forward: PageId::NONE,
        }
    }

    /// Read a leaf of tree `owner` from a page.
    pub fn from_page(page: &Page, owner: u32) -> Result<Self> {
        check_node(page, PageType::BTreeLeaf, owner)?;
        let count = usize::from(page.read_u16(COUNT_OFFSET));
        if count > leaf_capacity(page.size(), R::SIZE) {
            return Err(StoreError::corruption(
                page.page_id(),
                format!("leaf claims {count} rows"),
            ));
        }

        let rows = (0..count)
            .map(|i| R::decode(page.read_bytes(DATA_OFFSET + i * R::SIZE, R::SIZE)))
            .collect();
        Ok(Self {
            rows,
            forward: PageId::from_raw(page.read_u64(FORWARD_OFFSET)),
        })
    }

    /// Format `page` as this leaf.
    pub fn write_to_page(&self, page: &mut Page, page_id: PageId, owner: u32) {
        page.format(page_id, PageType::BTreeLeaf, owner);
        page.write_u16(LEVEL_OFFSET, 0);
        page.write_u16(COUNT_OFFSET, self.rows.len() as u16);
        page.write_u64(FORWARD_OFFSET, self.forward.as_raw());
        let mut offset = DATA_OFFSET;
        for row in &self.rows {
            row.encode(&mut page.as_bytes_mut()[offset..offset + R::SIZE]);
            offset += R::SIZE;
        }
    }

    /// Binary search for `key`.
    pub fn find(&self, key: &R) -> std::result::Result<usize, usize> {
        self.rows.binary_search(key)
    }

    /// Split the leaf, returning the new right half.
    ///
    /// The caller links the halves and uses the first row of the right half
    /// as the separator.
    #[must_use]
    pub fn split(&mut self) -> Self {
        let mid = self.rows.len() / 2;
        Self {
            rows: self.rows.split_off(mid),
            forward: self.forward,
        }
    }
}

/// An inner node.
///
/// `children[i]` holds rows `< keys[i]`, `children[i + 1]` holds rows `>= keys[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerNode<R> {
    pub level: u16,
    pub keys: Vec<R>,
    /// Child page pointers. `children.len()` == `keys.len()` + 1
    pub children: Vec<PageId>,
}

impl<R: TreeRow> InnerNode<R> {
    /// Create an inner node with two children, used when the root splits.
    #[must_use]
    pub fn with_children(level: u16, left: PageId, key: R, right: PageId) -> Self {
        Self {
            level,
            keys: vec![key],
            children: vec![left, right],
        }
    }

    /// Read an inner node of tree `owner` from a page.
    pub fn from_page(page: &Page, owner: u32) -> Result<Self> {
        check_node(page, PageType::BTreeInner, owner)?;
        let count = usize::from(page.read_u16(COUNT_OFFSET));
        if count > inner_capacity(page.size(), R::SIZE) {
            return Err(StoreError::corruption(
                page.page_id(),
                format!("inner node claims {count} keys"),
            ));
        }

        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        let mut offset = DATA_OFFSET;

        children.push(PageId::from_raw(page.read_u64(offset)));
        offset += CHILD_SIZE;

        for _ in 0..count {
            keys.push(R::decode(page.read_bytes(offset, R::SIZE)));
            offset += R::SIZE;
            children.push(PageId::from_raw(page.read_u64(offset)));
            offset += CHILD_SIZE;
        }

        Ok(Self {
            level: page.read_u16(LEVEL_OFFSET),
            keys,
            children,
        })
    }

    /// Format `page` as this inner node.
    pub fn write_to_page(&self, page: &mut Page, page_id: PageId, owner: u32) {
        page.format(page_id, PageType::BTreeInner, owner);
        page.write_u16(LEVEL_OFFSET, self.level);
        page.write_u16(COUNT_OFFSET, self.keys.len() as u16);

        let mut offset = DATA_OFFSET;
        page.write_u64(offset, self.children[0].as_raw());
        offset += CHILD_SIZE;

        for (key, child) in self.keys.iter().zip(&self.children[1..]) {
            key.encode(&mut page.as_bytes_mut()[offset..offset + R::SIZE]);
            offset += R::SIZE;
            page.write_u64(offset, child.as_raw());
            offset += CHILD_SIZE;
        }
    }

    /// Index of the child whose subtree may contain `key`.
    #[must_use]
    pub fn find_child_index(&self, key: &R) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i + 1, // Exact match, go right
            Err(i) => i,
        }
    }

    /// Insert a separator and its right child after child `index`.
    pub fn insert_at(&mut self, index: usize, key: R, right_child: PageId) {
        self.keys.insert(index, key);
        self.children.insert(index + 1, right_child);
    }

    /// Split the node, returning the median key and the new right node.
    #[must_use]
    pub fn split(&mut self) -> (R, Self) {
        let mid = self.keys.len() / 2;
        let median_key = self.keys[mid];

        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);

        // Remove median key from left node
        self.keys.pop();

        let right_node = Self {
            level: self.level,
            keys: right_keys,
            children: right_children,
        };
        (median_key, right_node)
    }
}

/// Content of a tree meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMeta {
    pub root: PageId,
    /// Number of levels; 1 when the root is a leaf.
    pub height: u16,
    pub size: u64,
}

impl TreeMeta {
    pub fn from_page(page: &Page, owner: u32) -> Result<Self> {
        check_node(page, PageType::BTreeMeta, owner)?;
        Ok(Self {
            root: PageId::from_raw(page.read_u64(META_ROOT_OFFSET)),
            height: page.read_u16(META_HEIGHT_OFFSET),
            size: page.read_u64(META_SIZE_OFFSET),
        })
    }

    pub fn write_to_page(&self, page: &mut Page, page_id: PageId, owner: u32) {
        page.format(page_id, PageType::BTreeMeta, owner);
        page.write_u64(META_ROOT_OFFSET, self.root.as_raw());
        page.write_u16(META_HEIGHT_OFFSET, self.height);
        page.write_u64(META_SIZE_OFFSET, self.size);
    }
}
