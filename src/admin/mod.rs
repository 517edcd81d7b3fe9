#![forbid(unsafe_code)]

//! Offline and online maintenance utilities.
//!
//! This module inspects store files and verifies the structural integrity of
//! trees, either through an open [`crate::GenTree`] or directly from a file no
//! tree has open.

mod error;
mod inspect;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Store metadata and state-record dumps.
pub use inspect::{inspect_file, MetaSection, StateSection, StoreInfo};

/// Opens an existing store for inspection.
pub use util::open_store;

/// Tree integrity verification.
///
/// Checks key order, separator bounds, balanced height, node fill and generation
/// bounds, and counts pointer slots left by a crashed session.
pub use verify::{
    verify_file, verify_store, verify_tree, VerifyCounts, VerifyFinding, VerifyReport,
    VerifySeverity,
};
