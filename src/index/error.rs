use std::path::PathBuf;

use thiserror::Error;

use crate::types::TreeError;

/// Errors surfaced by [`super::SchemaIndex`].
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index was closed or never finished opening.
    #[error("index has been closed")]
    Closed,
    /// Crash recovery failed; the index refuses use until it is rebuilt or a later
    /// open recovers it.
    #[error("index degraded: {0}")]
    Degraded(String),
    /// Another index in this process already has the store open.
    #[error("store already open: {0}")]
    AlreadyOpen(PathBuf),
    /// Tree engine failure.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Directory or file error while opening.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Configuration could not be read or is out of range.
    #[error("invalid index configuration: {0}")]
    Config(String),
}

impl IndexError {
    /// True when the underlying store is damaged and should be rebuilt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Tree(err) if err.is_corruption())
    }
}

/// Result alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
