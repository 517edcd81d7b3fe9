//! Generation-stamped copy-on-write B+ tree for on-disk schema indexes.
//!
//! The crate is layered bottom-up:
//!
//! - [`primitives`]: file I/O and the page cache ([`Pager`]).
//! - [`storage::btree`]: the tree engine ([`GenTree`]) generic over a [`Layout`].
//! - [`storage::recovery`]: the coordinator running crash cleanup passes.
//! - [`index`]: the lifecycle facade ([`SchemaIndex`]) binding a store file to an
//!   index identity.
//! - [`admin`]: offline inspection and structural verification.

#![warn(missing_docs)]

pub mod admin;
pub mod index;
pub mod primitives;
pub mod storage;
pub mod types;

pub use index::{IndexConfig, IndexDescriptor, IndexError, IndexMonitor, SchemaIndex};
pub use primitives::pager::{PageIntent, PageStore, Pager, PagerOptions};
pub use storage::btree::{
    BytesLayout, CounterMonitor, Cursor, GenTree, Generations, Layout, NoopMonitor, NumberKey,
    NumberLayout, TreeMonitor, TreeOptions, TreeStatsSnapshot, U64Layout,
};
pub use storage::recovery::{
    CleanupHandle, CleanupReport, CleanupState, ExecutionMode, RecoveryCoordinator,
};
pub use types::{PageId, Result, TreeError};
