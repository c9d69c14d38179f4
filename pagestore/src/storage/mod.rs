//! Page-oriented storage core.
//!
//! [`memory::PageMemory`] hands out fixed-size pages. On top of it, each
//! partition owns a [`reuse::ReuseList`] of emptied pages, a
//! [`free_list::FreeList`] storing variable-length rows and any number of
//! [`btree::BPlusTree`] indexes. Every mutation holds the read side of the
//! [`checkpoint::CheckpointLock`].

pub mod btree;
pub mod checkpoint;
pub mod data_page;
pub mod free_list;
pub mod memory;
pub mod page;
pub mod reuse;
pub mod time;

pub use btree::{BPlusTree, TreeCursor, TreeRow};
pub use checkpoint::{CheckpointLock, Checkpointer};
pub use free_list::{FreeList, Payload};
pub use memory::{PageMemory, PinnedPage};
pub use page::{Link, Page, PageFlag, PageId, PageType};
pub use reuse::ReuseList;
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
