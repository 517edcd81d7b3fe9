//! Index storage: the tree engine and crash recovery.

/// Generation-stamped copy-on-write B+ tree.
///
/// Layout contract, node pages, generation-safe pointers, header records, the
/// free list, cursors and the tree engine itself.
pub mod btree;

/// Background repair of pointers left behind by an unclean shutdown.
pub mod recovery;
