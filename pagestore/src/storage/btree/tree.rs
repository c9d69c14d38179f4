//! B+-tree operations.
//!
//! # Design
//!
//! - Writers (`put`, `remove`) hold the tree latch exclusively for the whole
//!   operation and the checkpoint lock's read side; readers (point lookups,
//!   cursor refills) hold the latch shared
//! - A mutation decodes the nodes on its path, edits them in memory and
//!   commits every modified page in one batch, locking pages top-down (meta
//!   page, then inner nodes by descending level, then leaves)
//! - Pages a split needs are reserved before anything is edited, so running
//!   out of memory leaves the tree untouched
//! - Underfull nodes are merged into a sibling when the union fits one page;
//!   there is no redistribution. A root inner node left with a single child is
//!   collapsed
//! - Pages freed by merges go back to the partition's reuse list while the
//!   latch is still held
//!
//! # Invariants
//!
//! - Rows are strictly increasing along the leaf chain
//! - `children[i]` holds rows `< keys[i]`, `children[i + 1]` rows `>= keys[i]`
//! - Every node of this tree carries `tree_id` as its page owner
//! - `size()` equals the number of rows reachable through the leaf chain

use std::cmp::Reverse;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{Result, StoreError};
use crate::storage::btree::cursor::TreeCursor;
use crate::storage::btree::node::{self, InnerNode, LeafNode, TreeMeta, TreeRow};
use crate::storage::checkpoint::CheckpointLock;
use crate::storage::memory::{PageMemory, PageWriteGuard, PinnedPage};
use crate::storage::page::{PageFlag, PageId, PageType};
use crate::storage::reuse::ReuseList;

/// Root location, guarded by the tree latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct TreeState {
    pub(super) root: PageId,
    /// Number of levels; 1 when the root is a leaf.
    pub(super) height: u16,
}

/// A decoded leaf together with where it was read from.
pub(super) struct LeafPosition<R> {
    pub(super) page_id: PageId,
    pub(super) generation: u32,
    pub(super) node: LeafNode<R>,
}

/// An inner node on the descent path and the child that was followed.
struct PathEntry<R> {
    page_id: PageId,
    node: InnerNode<R>,
    child_index: usize,
}

enum NodeWrite<R> {
    Meta(TreeMeta),
    Inner(InnerNode<R>),
    Leaf(LeafNode<R>),
}

struct PendingWrite<R> {
    page_id: PageId,
    /// Lock order: higher ranks are locked first.
    rank: u32,
    content: NodeWrite<R>,
}

/// Pages to write and pages to recycle for one mutation.
struct Batch<R> {
    writes: Vec<PendingWrite<R>>,
    freed: Vec<PageId>,
}

impl<R: TreeRow> Batch<R> {
    const fn new() -> Self {
        Self {
            writes: Vec::new(),
            freed: Vec::new(),
        }
    }

    fn leaf(&mut self, page_id: PageId, node: LeafNode<R>) {
        self.writes.push(PendingWrite {
            page_id,
            rank: 0,
            content: NodeWrite::Leaf(node),
        });
    }

    fn inner(&mut self, page_id: PageId, node: InnerNode<R>) {
        self.writes.push(PendingWrite {
            page_id,
            rank: u32::from(node.level),
            content: NodeWrite::Inner(node),
        });
    }

    fn meta(&mut self, page_id: PageId, state: TreeState, size: u64) {
        self.writes.push(PendingWrite {
            page_id,
            rank: u32::MAX,
            content: NodeWrite::Meta(TreeMeta {
                root: state.root,
                height: state.height,
                size,
            }),
        });
    }
}

/// An ordered set of fixed-size rows.
pub struct BPlusTree<R: TreeRow> {
    name: String,
    pub(super) tree_id: u32,
    pub(super) memory: Arc<PageMemory>,
    reuse: Arc<ReuseList>,
    checkpoint: Arc<CheckpointLock>,
    meta_page: PageId,
    state: RwLock<TreeState>,
    size: AtomicU64,
    leaf_capacity: usize,
    inner_capacity: usize,
    _rows: PhantomData<fn() -> R>,
}

impl<R: TreeRow> BPlusTree<R> {
    /// Create an empty tree whose pages come from `reuse`.
    ///
    /// `tree_id` is stamped on every page of the tree and must be unique
    /// among trees sharing the page memory.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if the meta and root pages cannot be obtained
    pub fn create(
        name: impl Into<String>,
        tree_id: u32,
        reuse: Arc<ReuseList>,
        checkpoint: Arc<CheckpointLock>,
    ) -> Result<Self> {
        let memory = Arc::clone(reuse.memory());
        let page_size = memory.page_size();
        let mut tree = Self {
            name: name.into(),
            tree_id,
            memory,
            reuse,
            checkpoint,
            meta_page: PageId::NONE,
            state: RwLock::new(TreeState {
                root: PageId::NONE,
                height: 1,
            }),
            size: AtomicU64::new(0),
            leaf_capacity: node::leaf_capacity(page_size, R::SIZE),
            inner_capacity: node::inner_capacity(page_size, R::SIZE),
            _rows: PhantomData,
        };

        let pages = tree.reserve_pages(2)?;
        tree.meta_page = pages[0];
        let state = TreeState {
            root: pages[1],
            height: 1,
        };
        *tree.state.get_mut() = state;

        {
            let _checkpoint = tree.checkpoint.read()?;
            let mut batch = Batch::new();
            batch.meta(tree.meta_page, state, 0);
            batch.leaf(state.root, LeafNode::empty());
            tree.commit(batch.writes)?;
        }

        tracing::debug!(
            tree = %tree.name,
            tree_id,
            meta = %tree.meta_page,
            leaf_capacity = tree.leaf_capacity,
            inner_capacity = tree.inner_capacity,
            "created tree"
        );
        Ok(tree)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn tree_id(&self) -> u32 {
        self.tree_id
    }

    #[must_use]
    pub const fn meta_page(&self) -> PageId {
        self.meta_page
    }

    /// Maximum number of rows in one leaf.
    #[must_use]
    pub const fn leaf_capacity(&self) -> usize {
        self.leaf_capacity
    }

    /// Maximum number of keys in one inner node.
    #[must_use]
    pub const fn inner_capacity(&self) -> usize {
        self.inner_capacity
    }

    /// Number of rows.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Whether the tree holds no rows. Does not touch any page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current root page.
    #[must_use]
    pub fn root(&self) -> PageId {
        self.state.read().root
    }

    /// Number of levels; 1 while the root is a leaf.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.state.read().height
    }

    /// Insert `row`, replacing and returning an equal row if one exists.
    ///
    /// # Errors
    /// - [`StoreError::OutOfMemory`] if a split needs pages that cannot be
    ///   obtained; the tree is unchanged
    ///
    /// Pages reserved for a split that does not complete go back to the
    /// reuse list.
    /// - [`StoreError::LockTimeout`] if a checkpoint holds the lock too long
    /// - [`StoreError::StructureCorruption`] if a node on the path is damaged
    pub fn put(&self, row: R) -> Result<Option<R>> {
        let _checkpoint = self.checkpoint.read()?;
        let mut state = self.state.write();
        let (mut path, leaf_id, mut leaf) = self.descend_for_update(&state, &row)?;

        let mut batch = Batch::new();
        let index = match leaf.find(&row) {
            Ok(index) => {
                let old = std::mem::replace(&mut leaf.rows[index], row);
                batch.leaf(leaf_id, leaf);
                self.commit(batch.writes)?;
                return Ok(Some(old));
            }
            Err(index) => index,
        };
        leaf.rows.insert(index, row);
        let size = self.size() + 1;

        let mut reserved = Vec::new();
        let new_state = if leaf.rows.len() <= self.leaf_capacity {
            batch.leaf(leaf_id, leaf);
            *state
        } else {
            reserved = self.reserve_pages(self.pages_for_split(&path))?;
            let mut spare = reserved.clone();
            match self.split_leaf(&mut path, leaf_id, leaf, *state, &mut spare, &mut batch) {
                Ok(new_state) => {
                    self.release_pages(&spare);
                    reserved.retain(|page_id| !spare.contains(page_id));
                    new_state
                }
                Err(err) => {
                    self.release_pages(&reserved);
                    return Err(err);
                }
            }
        };

        batch.meta(self.meta_page, new_state, size);
        if let Err(err) = self.commit(batch.writes) {
            self.release_pages(&reserved);
            return Err(err);
        }
        *state = new_state;
        self.size.store(size, Ordering::Release);
        Ok(None)
    }

    /// Remove the row equal to `key`, returning it.
    ///
    /// # Errors
    /// - [`StoreError::LockTimeout`] if a checkpoint holds the lock too long
    /// - [`StoreError::StructureCorruption`] if a node on the path is damaged
    pub fn remove(&self, key: &R) -> Result<Option<R>> {
        let _checkpoint = self.checkpoint.read()?;
        let mut state = self.state.write();
        let (mut path, leaf_id, mut leaf) = self.descend_for_update(&state, key)?;

        let Ok(index) = leaf.find(key) else {
            return Ok(None);
        };
        let removed = leaf.rows.remove(index);
        let size = self.size().saturating_sub(1);

        let mut batch = Batch::new();
        let new_state = if path.is_empty() || leaf.rows.len() >= self.leaf_low_water() {
            batch.leaf(leaf_id, leaf);
            *state
        } else {
            self.merge_leaf(&mut path, leaf_id, leaf, *state, &mut batch)?
        };

        batch.meta(self.meta_page, new_state, size);
        self.commit(batch.writes)?;
        if new_state != *state {
            tracing::debug!(
                tree = %self.name,
                root = %new_state.root,
                height = new_state.height,
                "root collapsed"
            );
        }
        *state = new_state;
        self.size.store(size, Ordering::Release);

        for page_id in batch.freed {
            self.reuse.recycle(page_id)?;
        }
        Ok(Some(removed))
    }

    /// Remove the row equal to `key`, reporting whether it was present.
    pub fn removex(&self, key: &R) -> Result<bool> {
        Ok(self.remove(key)?.is_some())
    }

    /// Look up the row equal to `key`.
    pub fn find_one(&self, key: &R) -> Result<Option<R>> {
        let state = self.state.read();
        let position = self.find_leaf(&state, Bound::Included(key))?;
        Ok(position
            .node
            .find(key)
            .ok()
            .map(|index| position.node.rows[index]))
    }

    /// Open a cursor over the rows within `lower..upper`.
    ///
    /// The cursor stays valid while the tree is modified, including by the
    /// caller between two steps.
    pub fn find(&self, lower: Bound<R>, upper: Bound<R>) -> Result<TreeCursor<'_, R>> {
        TreeCursor::open(self, lower, upper)
    }

    /// Number of leaves on the leaf chain.
    pub fn leaf_count(&self) -> Result<usize> {
        let state = self.state.read();
        let mut position = self.find_leaf(&state, Bound::Unbounded)?;
        let mut count = 1;
        while !position.node.forward.is_none() {
            position = self.read_leaf(position.node.forward)?;
            count += 1;
            if count as u64 > self.memory.allocated_pages() {
                return Err(StoreError::corruption(position.page_id, "leaf chain loops"));
            }
        }
        Ok(count)
    }

    /// Walk the leaf chain checking row order and the row count.
    pub fn validate(&self) -> Result<()> {
        let state = self.state.read();
        let mut position = self.find_leaf(&state, Bound::Unbounded)?;
        let mut previous: Option<R> = None;
        let mut rows = 0u64;
        loop {
            for row in &position.node.rows {
                if previous.is_some_and(|prev| prev >= *row) {
                    return Err(StoreError::corruption(
                        position.page_id,
                        format!("row {row:?} after {previous:?}"),
                    ));
                }
                previous = Some(*row);
                rows += 1;
            }
            if position.node.forward.is_none() {
                break;
            }
            position = self.read_leaf(position.node.forward)?;
        }

        let size = self.size();
        if rows != size {
            return Err(StoreError::corruption(
                self.meta_page,
                format!("leaf chain holds {rows} rows, size is {size}"),
            ));
        }
        Ok(())
    }

    pub(super) fn state(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read()
    }

    /// Descend to the leaf where rows at `key` live.
    ///
    /// `Unbounded` goes to the leftmost leaf.
    pub(super) fn find_leaf(&self, state: &TreeState, key: Bound<&R>) -> Result<LeafPosition<R>> {
        let mut page_id = state.root;
        for _ in 1..state.height {
            let node = self.read_inner(page_id)?;
            page_id = match key {
                Bound::Included(key) | Bound::Excluded(key) => {
                    node.children[node.find_child_index(key)]
                }
                Bound::Unbounded => node.children[0],
            };
        }
        self.read_leaf(page_id)
    }

    fn pin_node(&self, page_id: PageId) -> Result<PinnedPage> {
        self.memory.pin(page_id).map_err(|_| {
            StoreError::corruption(
                page_id,
                format!("tree {} references an unallocated page", self.name),
            )
        })
    }

    fn read_inner(&self, page_id: PageId) -> Result<InnerNode<R>> {
        let pinned = self.pin_node(page_id)?;
        let page = pinned.read();
        InnerNode::from_page(&page, self.tree_id)
    }

    fn read_leaf(&self, page_id: PageId) -> Result<LeafPosition<R>> {
        let pinned = self.pin_node(page_id)?;
        let page = pinned.read();
        Ok(LeafPosition {
            page_id,
            generation: page.generation(),
            node: LeafNode::from_page(&page, self.tree_id)?,
        })
    }

    fn descend_for_update(
        &self,
        state: &TreeState,
        key: &R,
    ) -> Result<(Vec<PathEntry<R>>, PageId, LeafNode<R>)> {
        let mut path = Vec::with_capacity(usize::from(state.height));
        let mut page_id = state.root;
        for _ in 1..state.height {
            let node = self.read_inner(page_id)?;
            let child_index = node.find_child_index(key);
            let child = node.children[child_index];
            path.push(PathEntry {
                page_id,
                node,
                child_index,
            });
            page_id = child;
        }
        let leaf = self.read_leaf(page_id)?;
        Ok((path, page_id, leaf.node))
    }

    fn leaf_low_water(&self) -> usize {
        (self.leaf_capacity / 4).max(1)
    }

    fn inner_low_water(&self) -> usize {
        (self.inner_capacity / 4).max(1)
    }

    /// Pages needed to split a leaf at the end of `path`: the new leaf, one
    /// per full ancestor, and a new root if every ancestor is full.
    fn pages_for_split(&self, path: &[PathEntry<R>]) -> usize {
        let mut pages = 1;
        for entry in path.iter().rev() {
            if entry.node.keys.len() < self.inner_capacity {
                return pages;
            }
            pages += 1;
        }
        pages + 1
    }

    fn reserve_pages(&self, count: usize) -> Result<Vec<PageId>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.reuse.take_or_allocate(PageFlag::Index) {
                Ok(page_id) => pages.push(page_id),
                Err(err) => {
                    self.release_pages(&pages);
                    return Err(err);
                }
            }
        }
        Ok(pages)
    }

    /// Hand reserved but unused pages back to the reuse list.
    fn release_pages(&self, pages: &[PageId]) {
        for &page_id in pages {
            let result = self.memory.pin(page_id).and_then(|pinned| {
                pinned.write().set_page_type(PageType::Fresh);
                self.reuse.recycle(page_id)
            });
            if let Err(err) = result {
                tracing::warn!(tree = %self.name, %page_id, %err, "failed to release reserved page");
            }
        }
    }

    fn spare_page(&self, spare: &mut Vec<PageId>) -> Result<PageId> {
        spare
            .pop()
            .ok_or_else(|| StoreError::corruption(self.meta_page, "split ran out of reserved pages"))
    }

    fn split_leaf(
        &self,
        path: &mut Vec<PathEntry<R>>,
        leaf_id: PageId,
        mut leaf: LeafNode<R>,
        state: TreeState,
        spare: &mut Vec<PageId>,
        batch: &mut Batch<R>,
    ) -> Result<TreeState> {
        let right_id = self.spare_page(spare)?;
        let right = leaf.split();
        leaf.forward = right_id;
        let separator = right.rows[0];
        batch.leaf(leaf_id, leaf);
        batch.leaf(right_id, right);
        tracing::debug!(tree = %self.name, left = %leaf_id, right = %right_id, "leaf split");

        self.insert_into_parent(path, leaf_id, separator, right_id, state, spare, batch)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_into_parent(
        &self,
        path: &mut Vec<PathEntry<R>>,
        mut left_id: PageId,
        mut separator: R,
        mut right_id: PageId,
        state: TreeState,
        spare: &mut Vec<PageId>,
        batch: &mut Batch<R>,
    ) -> Result<TreeState> {
        while let Some(PathEntry {
            page_id,
            mut node,
            child_index,
        }) = path.pop()
        {
            node.insert_at(child_index, separator, right_id);
            if node.keys.len() <= self.inner_capacity {
                batch.inner(page_id, node);
                return Ok(state);
            }

            let new_id = self.spare_page(spare)?;
            let (median, right) = node.split();
            batch.inner(page_id, node);
            batch.inner(new_id, right);
            tracing::debug!(tree = %self.name, left = %page_id, right = %new_id, "inner split");

            left_id = page_id;
            separator = median;
            right_id = new_id;
        }

        let root_id = self.spare_page(spare)?;
        batch.inner(
            root_id,
            InnerNode::with_children(state.height, left_id, separator, right_id),
        );
        tracing::debug!(
            tree = %self.name,
            root = %root_id,
            height = state.height + 1,
            "new root"
        );
        Ok(TreeState {
            root: root_id,
            height: state.height + 1,
        })
    }

    fn merge_leaf(
        &self,
        path: &mut Vec<PathEntry<R>>,
        leaf_id: PageId,
        leaf: LeafNode<R>,
        state: TreeState,
        batch: &mut Batch<R>,
    ) -> Result<TreeState> {
        let Some(PathEntry {
            page_id: parent_id,
            node: mut parent,
            child_index,
        }) = path.pop()
        else {
            batch.leaf(leaf_id, leaf);
            return Ok(state);
        };
        if parent.children.len() < 2 {
            batch.leaf(leaf_id, leaf);
            return Ok(state);
        }

        let (left_index, (left_id, mut left), (right_id, right)) =
            if child_index + 1 < parent.children.len() {
                let sibling = parent.children[child_index + 1];
                (
                    child_index,
                    (leaf_id, leaf),
                    (sibling, self.read_leaf(sibling)?.node),
                )
            } else {
                let sibling = parent.children[child_index - 1];
                (
                    child_index - 1,
                    (sibling, self.read_leaf(sibling)?.node),
                    (leaf_id, leaf),
                )
            };

        if left.rows.len() + right.rows.len() > self.leaf_capacity {
            if left_id == leaf_id {
                batch.leaf(left_id, left);
            } else {
                batch.leaf(right_id, right);
            }
            return Ok(state);
        }

        left.rows.extend(right.rows);
        left.forward = right.forward;
        parent.keys.remove(left_index);
        parent.children.remove(left_index + 1);
        batch.leaf(left_id, left);
        batch.freed.push(right_id);
        tracing::debug!(tree = %self.name, left = %left_id, right = %right_id, "merged leaves");

        self.merge_inner(path, parent_id, parent, state, batch)
    }

    fn merge_inner(
        &self,
        path: &mut Vec<PathEntry<R>>,
        node_id: PageId,
        node: InnerNode<R>,
        state: TreeState,
        batch: &mut Batch<R>,
    ) -> Result<TreeState> {
        let Some(PathEntry {
            page_id: parent_id,
            node: mut parent,
            child_index,
        }) = path.pop()
        else {
            if node.keys.is_empty() {
                batch.freed.push(node_id);
                return Ok(TreeState {
                    root: node.children[0],
                    height: state.height - 1,
                });
            }
            batch.inner(node_id, node);
            return Ok(state);
        };

        if node.keys.len() >= self.inner_low_water() || parent.children.len() < 2 {
            batch.inner(node_id, node);
            return Ok(state);
        }

        let (left_index, (left_id, mut left), (right_id, right)) =
            if child_index + 1 < parent.children.len() {
                let sibling = parent.children[child_index + 1];
                (
                    child_index,
                    (node_id, node),
                    (sibling, self.read_inner(sibling)?),
                )
            } else {
                let sibling = parent.children[child_index - 1];
                (
                    child_index - 1,
                    (sibling, self.read_inner(sibling)?),
                    (node_id, node),
                )
            };

        if left.keys.len() + 1 + right.keys.len() > self.inner_capacity {
            if left_id == node_id {
                batch.inner(left_id, left);
            } else {
                batch.inner(right_id, right);
            }
            return Ok(state);
        }

        let separator = parent.keys.remove(left_index);
        parent.children.remove(left_index + 1);
        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);
        batch.inner(left_id, left);
        batch.freed.push(right_id);
        tracing::debug!(tree = %self.name, left = %left_id, right = %right_id, "merged inner nodes");

        self.merge_inner(path, parent_id, parent, state, batch)
    }

    /// Write a batch, locking pages top-down.
    fn commit(&self, mut writes: Vec<PendingWrite<R>>) -> Result<()> {
        writes.sort_by_key(|write| Reverse(write.rank));
        let pins = writes
            .iter()
            .map(|write| self.pin_node(write.page_id))
            .collect::<Result<Vec<_>>>()?;
        let mut guards: Vec<PageWriteGuard<'_>> = pins.iter().map(PinnedPage::write).collect();

        for (write, page) in writes.iter().zip(guards.iter_mut()) {
            match &write.content {
                NodeWrite::Meta(meta) => meta.write_to_page(page, write.page_id, self.tree_id),
                NodeWrite::Inner(node) => node.write_to_page(page, write.page_id, self.tree_id),
                NodeWrite::Leaf(node) => node.write_to_page(page, write.page_id, self.tree_id),
            }
        }
        Ok(())
    }
}

impl<R: TreeRow> std::fmt::Debug for BPlusTree<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("name", &self.name)
            .field("tree_id", &self.tree_id)
            .field("size", &self.size())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}
