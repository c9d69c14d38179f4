//! Generic B+-tree over fixed-size rows, used for the per-partition data
//! and pending-expiration indexes.

mod cursor;
mod node;
mod tree;

pub use cursor::TreeCursor;
pub use node::{InnerNode, LeafNode, TreeMeta, TreeRow, inner_capacity, leaf_capacity};
pub use tree::BPlusTree;
