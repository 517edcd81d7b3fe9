//! Process-wide set of store files held open by a [`super::SchemaIndex`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::error::{IndexError, Result};

static OPEN_STORES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Claim on one store path. Dropping it releases the path.
#[derive(Debug)]
pub(crate) struct Registration {
    path: PathBuf,
}

impl Registration {
    /// Claims `path`, failing with [`IndexError::AlreadyOpen`] if it is held.
    ///
    /// The parent directory must exist; the file itself need not.
    pub(crate) fn claim(path: &Path) -> Result<Self> {
        let path = canonical(path)?;
        let mut open = OPEN_STORES.lock();
        if !open.insert(path.clone()) {
            return Err(IndexError::AlreadyOpen(path));
        }
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_STORES.lock().remove(&self.path);
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }
    let name = path
        .file_name()
        .ok_or_else(|| IndexError::Config(format!("{} does not name a file", path.display())))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(fs::canonicalize(parent)?.join(name))
}
