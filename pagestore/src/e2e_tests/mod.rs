//! End-to-end scenarios over the storage core and the cache engine.
//!
//! Each test file covers one scenario, using deterministic inputs (seeded
//! random generators, a manual clock) so failures reproduce.

#![cfg(test)]

mod helpers;

mod test_free_list_stress;
mod test_page_reuse;
mod test_partition_affinity;
mod test_pending_tree_cursor;
mod test_tree_order;
