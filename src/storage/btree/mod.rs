#![forbid(unsafe_code)]

//! Generation-stamped copy-on-write B+ tree.

/// Reference layouts.
pub mod codecs;
/// Released-page bookkeeping.
pub mod freelist;
pub mod gsp;
/// Meta page and alternating tree-state records.
pub mod header;
/// On-page node format.
pub mod page;

mod cursor;
mod layout;
mod monitor;
mod stats;
mod tree;

pub use codecs::{BytesLayout, NumberKey, NumberLayout, U64Layout};
pub use cursor::Cursor;
pub use gsp::Generations;
pub use layout::Layout;
pub use monitor::{CounterMonitor, NoopMonitor, TreeMonitor};
pub use page::Capacity;
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{GenTree, TreeOptions};
