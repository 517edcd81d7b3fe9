//! Low-level primitives the tree is built on.
//!
//! Includes byte utilities, positioned file I/O and the page cache.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Interfaces for reading and writing data at file offsets.
pub mod io;

/// Paging subsystem.
///
/// Fixed-size page access through scoped cursors over an LRU page cache.
pub mod pager;
