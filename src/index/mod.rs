//! Schema index lifecycle.
//!
//! A [`SchemaIndex`] binds one store file and one [`Layout`] to a logical index
//! identity. It creates the store directory, claims the file in the process-wide
//! registry, opens the tree with a monitor that reports recovery against the
//! index identity, and guards every delegated call with [`SchemaIndex::assert_open`].

use std::fmt;
use std::fs;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::primitives::pager::Pager;
use crate::storage::btree::{Cursor, GenTree, Layout, TreeMonitor, TreeStatsSnapshot};
use crate::storage::recovery::{CleanupHandle, CleanupState, RecoveryCoordinator};
use crate::types::TreeError;

mod config;
mod error;
mod registry;

pub use config::IndexConfig;
pub use error::{IndexError, Result};

use registry::Registration;

/// Header writer for indexes that store no payload.
pub fn no_header_writer(_payload: &mut Vec<u8>) {}

/// Identity of the index a store backs, used in log lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Numeric index id.
    pub id: u64,
    /// Human-readable schema description, e.g. `Index( GENERAL, :Person(age) )`.
    pub description: String,
}

impl IndexDescriptor {
    /// Creates a descriptor.
    pub fn new(id: u64, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[indexId:{}, descriptor:'{}']", self.id, self.description)
    }
}

/// Tree monitor that logs recovery events against an index identity.
#[derive(Debug)]
pub struct IndexMonitor {
    descriptor: IndexDescriptor,
}

impl IndexMonitor {
    /// Monitor for `descriptor`.
    pub fn new(descriptor: IndexDescriptor) -> Self {
        Self { descriptor }
    }
}

impl TreeMonitor for IndexMonitor {
    fn startup_state(&self, clean: bool) {
        if !clean {
            warn!(index = %self.descriptor, "gentree.index.unclean_shutdown");
        }
    }

    fn cleanup_registered(&self) {
        debug!(index = %self.descriptor, "gentree.index.recovery_scheduled");
    }

    fn cleanup_finished(&self, pages_visited: u64, pointers_cleaned: u64, duration_ms: u64) {
        info!(
            index = %self.descriptor,
            pages_visited,
            pointers_cleaned,
            duration = %format_duration(duration_ms),
            "{} Schema index recovery completed. Number of pages visited: {}. \
             Number of cleaned crashed pointers: {}. Time spent: {}.",
            self.descriptor,
            pages_visited,
            pointers_cleaned,
            format_duration(duration_ms)
        );
    }

    fn cleanup_failed(&self, error: &TreeError) {
        error!(index = %self.descriptor, error = %error, "gentree.index.recovery_failed");
    }
}

/// Renders milliseconds the way recovery log lines show them.
pub fn format_duration(ms: u64) -> String {
    match ms {
        0..=999 => format!("{ms}ms"),
        1_000..=59_999 => format!("{}s {}ms", ms / 1_000, ms % 1_000),
        _ => format!("{}m {}s", ms / 60_000, (ms / 1_000) % 60),
    }
}

/// One open schema index.
pub struct SchemaIndex<L: Layout> {
    descriptor: IndexDescriptor,
    path: PathBuf,
    tree: Mutex<Option<GenTree<L>>>,
    registration: Mutex<Option<Registration>>,
}

impl<L: Layout> SchemaIndex<L> {
    /// Opens the store at `path`, creating it and its directory if needed.
    ///
    /// `header_writer` runs only when the store is created. If the previous
    /// session crashed, a cleanup pass is scheduled on `coordinator`.
    pub fn open<F>(
        descriptor: IndexDescriptor,
        path: impl AsRef<Path>,
        layout: L,
        config: &IndexConfig,
        header_writer: F,
        coordinator: &RecoveryCoordinator,
    ) -> Result<Self>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        config.validate()?;
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        let registration = Registration::claim(path)?;
        let store = Arc::new(Pager::open(path, config.pager_options())?);
        let monitor = Arc::new(IndexMonitor::new(descriptor.clone()));
        let tree = GenTree::open(
            store,
            layout,
            config.tree_options(),
            header_writer,
            coordinator,
            monitor,
        )?;
        info!(index = %descriptor, path = %path.display(), "gentree.index.opened");
        Ok(Self {
            descriptor,
            path: registration.path().to_path_buf(),
            tree: Mutex::new(Some(tree)),
            registration: Mutex::new(Some(registration)),
        })
    }

    /// Identity of this index.
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Canonical path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails once the index is closed or when crash recovery failed.
    pub fn assert_open(&self) -> Result<()> {
        self.tree().map(|_| ())
    }

    fn tree(&self) -> Result<GenTree<L>> {
        let tree = self.tree.lock().clone().ok_or(IndexError::Closed)?;
        if let Some(handle) = tree.cleanup_handle() {
            if handle.state() == CleanupState::Failed {
                let reason = match handle.wait() {
                    Err(err) => err.to_string(),
                    Ok(_) => "crash cleanup failed".to_string(),
                };
                return Err(IndexError::Degraded(reason));
            }
        }
        if let Some(reason) = tree.degraded() {
            return Err(IndexError::Degraded(reason));
        }
        Ok(tree)
    }

    /// Cursor over `[from, to)`; `to` is included when it is the layout's highest key.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Cursor<L>> {
        Ok(self.tree()?.seek(from, to)?)
    }

    /// Cursor over an arbitrary key range.
    pub fn seek_range<R: RangeBounds<L::Key>>(&self, range: R) -> Result<Cursor<L>> {
        Ok(self.tree()?.seek_range(range)?)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        Ok(self.tree()?.get(key)?)
    }

    /// Inserts or replaces `key`.
    pub fn insert(&self, key: L::Key, value: L::Value) -> Result<()> {
        Ok(self.tree()?.insert(key, value)?)
    }

    /// Removes `key`, returning its value when present.
    pub fn remove(&self, key: &L::Key) -> Result<Option<L::Value>> {
        Ok(self.tree()?.remove(key)?)
    }

    /// Publishes everything written so far.
    pub fn checkpoint(&self) -> Result<()> {
        Ok(self.tree()?.checkpoint()?)
    }

    /// Caller payload stored in the store header.
    pub fn header(&self) -> Result<Vec<u8>> {
        Ok(self.tree()?.header())
    }

    /// Handle to the crash cleanup scheduled at open, if any.
    ///
    /// Available even when the pass failed, so callers can inspect it.
    pub fn cleanup_handle(&self) -> Option<CleanupHandle> {
        self.tree.lock().as_ref().and_then(GenTree::cleanup_handle)
    }

    /// Tree operation counters.
    pub fn stats(&self) -> Result<TreeStatsSnapshot> {
        Ok(self.tree()?.stats())
    }

    /// The underlying tree.
    pub fn tree_handle(&self) -> Result<GenTree<L>> {
        self.tree()
    }

    /// True once [`SchemaIndex::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.tree.lock().is_none()
    }

    /// Checkpoints, closes the tree and releases the store path. Idempotent.
    pub fn close(&self) -> Result<()> {
        let Some(tree) = self.tree.lock().take() else {
            return Ok(());
        };
        let result = tree.close();
        self.registration.lock().take();
        result?;
        info!(index = %self.descriptor, "gentree.index.closed");
        Ok(())
    }
}

impl<L: Layout> fmt::Debug for SchemaIndex<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaIndex")
            .field("descriptor", &self.descriptor)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_renders_like_log_prefix() {
        let descriptor = IndexDescriptor::new(7, "Index( GENERAL, :Person(age) )");
        assert_eq!(
            descriptor.to_string(),
            "[indexId:7, descriptor:'Index( GENERAL, :Person(age) )']"
        );
    }

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(format_duration(0), "0ms");
        assert_eq!(format_duration(999), "999ms");
        assert_eq!(format_duration(1_250), "1s 250ms");
        assert_eq!(format_duration(125_000), "2m 5s");
    }
}
