//! Shared identifiers, error type and on-disk page metadata.

#![forbid(unsafe_code)]

use std::fmt;

/// Checksum helpers used for page and pointer integrity.
pub mod checksum;
/// Common page header shared by every page in a store file.
pub mod page;

pub use checksum::{page_crc32, slot_crc32};

/// Identifier of a fixed-size page within a store file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the tree engine and its storage layers.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Underlying file operation failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A page, pointer or record failed validation.
    #[error("store corrupt: {0}")]
    Corruption(&'static str),
    /// The store was written with a different layout or format.
    #[error("store metadata mismatch: {0}")]
    MetadataMismatch(&'static str),
    /// The caller supplied an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The tree has been closed.
    #[error("index has been closed")]
    Closed,
    /// A second writer attempted to mutate the tree concurrently.
    #[error("concurrent writer detected; writes must be serialized by the caller")]
    ConcurrentWriter,
    /// The crash-pointer cleanup pass did not complete.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
    /// A previous write failed midway and the in-memory tree can no longer be trusted.
    #[error("tree degraded: {0}")]
    Degraded(String),
}

impl TreeError {
    /// Returns true for errors that indicate the store contents are damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TreeError::Corruption(_) | TreeError::MetadataMismatch(_))
    }

    /// Returns true for errors caused by API misuse rather than storage state.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            TreeError::Closed | TreeError::ConcurrentWriter | TreeError::Invalid(_)
        )
    }

    /// Returns true for transient I/O failures.
    pub fn is_io(&self) -> bool {
        matches!(self, TreeError::Io(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;
