//! Range cursor over a [`BPlusTree`].
//!
//! A cursor keeps a copy of the qualifying rows of the leaf it is positioned
//! on, the leaf's page id and generation, and the last row it returned. It
//! never holds a latch or page lock between two calls, so the tree may be
//! modified freely while a cursor is open.
//!
//! # Refill protocol
//!
//! When the cached rows run out the cursor takes the tree latch shared and:
//!
//! 1. Re-reads its current leaf. If the page was freed, recycled (generation
//!    changed) or no longer is a leaf of this tree, it seeks from the root to
//!    the last returned row instead
//! 2. Rows greater than the last returned row that arrived in the leaf since
//!    it was cached are returned next
//! 3. Otherwise it follows the forward link. The link target must be a leaf of
//!    the same tree; anything else is reported as corruption
//!
//! # Invariants
//!
//! - Rows are returned in strictly increasing order and never twice
//! - Rows present for the whole lifetime of the cursor and within range are
//!   returned exactly once

use std::ops::Bound;

use crate::error::{Result, StoreError};
use crate::storage::btree::node::{LeafNode, TreeRow};
use crate::storage::btree::tree::{BPlusTree, TreeState};
use crate::storage::page::{PageId, PageType};

/// Cursor returned by [`BPlusTree::find`].
pub struct TreeCursor<'t, R: TreeRow> {
    tree: &'t BPlusTree<R>,
    lower: Bound<R>,
    upper: Bound<R>,
    page: PageId,
    generation: u32,
    rows: Vec<R>,
    pos: usize,
    last: Option<R>,
    done: bool,
}

impl<'t, R: TreeRow> TreeCursor<'t, R> {
    pub(super) fn open(tree: &'t BPlusTree<R>, lower: Bound<R>, upper: Bound<R>) -> Result<Self> {
        let mut cursor = Self {
            tree,
            lower,
            upper,
            page: PageId::NONE,
            generation: 0,
            rows: Vec::new(),
            pos: 0,
            last: None,
            done: false,
        };
        let state = tree.state();
        cursor.seek(&state)?;
        drop(state);
        Ok(cursor)
    }

    /// The row most recently returned.
    #[must_use]
    pub const fn get(&self) -> Option<&R> {
        self.last.as_ref()
    }

    /// Advance to the next row in range.
    ///
    /// After an error the cursor is exhausted.
    ///
    /// # Errors
    /// - [`StoreError::StructureCorruption`] if a forward link leads outside the tree
    pub fn next_row(&mut self) -> Result<Option<R>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some(&row) = self.rows.get(self.pos) {
                self.pos += 1;
                if !self.before_end(&row) {
                    self.finish();
                    return Ok(None);
                }
                self.last = Some(row);
                return Ok(Some(row));
            }

            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    self.finish();
                    return Ok(None);
                }
                Err(err) => {
                    self.finish();
                    return Err(err);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.rows.clear();
        self.pos = 0;
    }

    fn after_start(&self, row: &R) -> bool {
        match (&self.last, &self.lower) {
            (Some(last), _) => row > last,
            (None, Bound::Included(lower)) => row >= lower,
            (None, Bound::Excluded(lower)) => row > lower,
            (None, Bound::Unbounded) => true,
        }
    }

    fn before_end(&self, row: &R) -> bool {
        match &self.upper {
            Bound::Included(upper) => row <= upper,
            Bound::Excluded(upper) => row < upper,
            Bound::Unbounded => true,
        }
    }

    fn load(&mut self, page: PageId, generation: u32, rows: Vec<R>) {
        let rows = rows.into_iter().filter(|row| self.after_start(row)).collect();
        self.page = page;
        self.generation = generation;
        self.rows = rows;
        self.pos = 0;
    }

    /// Position on the leaf holding the first row after the last one returned.
    fn seek(&mut self, state: &TreeState) -> Result<()> {
        let key = match &self.last {
            Some(last) => Bound::Included(last),
            None => self.lower.as_ref(),
        };
        let position = self.tree.find_leaf(state, key)?;
        self.load(position.page_id, position.generation, position.node.rows);
        Ok(())
    }

    /// Load more rows. Returns `false` once the leaf chain is exhausted.
    fn refill(&mut self) -> Result<bool> {
        let tree = self.tree;
        let state = tree.state();

        let Ok(pinned) = tree.memory.pin(self.page) else {
            tracing::trace!(page = %self.page, "cursor leaf freed, seeking again");
            self.seek(&state)?;
            return Ok(true);
        };
        let page = pinned.read();
        if page.generation() != self.generation
            || page.page_type() != Some(PageType::BTreeLeaf)
            || page.owner() != tree.tree_id
        {
            drop(page);
            tracing::trace!(page = %self.page, "cursor leaf recycled, seeking again");
            self.seek(&state)?;
            return Ok(true);
        }

        let leaf = LeafNode::<R>::from_page(&page, tree.tree_id)?;
        let forward = leaf.forward;
        let fresh: Vec<R> = leaf
            .rows
            .into_iter()
            .filter(|row| self.after_start(row))
            .collect();
        if !fresh.is_empty() {
            self.rows = fresh;
            self.pos = 0;
            return Ok(true);
        }
        if forward.is_none() {
            return Ok(false);
        }

        // Hold the current leaf while reading its successor.
        let next_pinned = tree.memory.pin(forward).map_err(|_| {
            StoreError::corruption(
                self.page,
                format!("forward link to unallocated page {forward}"),
            )
        })?;
        let next_page = next_pinned.read();
        if next_page.page_type() != Some(PageType::BTreeLeaf) || next_page.owner() != tree.tree_id {
            return Err(StoreError::corruption(
                forward,
                format!(
                    "forward link from {} reaches a {:?} page owned by {}",
                    self.page,
                    next_page.page_type(),
                    next_page.owner()
                ),
            ));
        }
        let next_leaf = LeafNode::<R>::from_page(&next_page, tree.tree_id)?;
        let generation = next_page.generation();
        drop(next_page);
        drop(page);

        self.load(forward, generation, next_leaf.rows);
        Ok(true)
    }
}

impl<R: TreeRow> Iterator for TreeCursor<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl<R: TreeRow> std::iter::FusedIterator for TreeCursor<'_, R> {}

impl<R: TreeRow> std::fmt::Debug for TreeCursor<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCursor")
            .field("tree", &self.tree.name())
            .field("page", &self.page)
            .field("generation", &self.generation)
            .field("last", &self.last)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
