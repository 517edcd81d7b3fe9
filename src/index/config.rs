use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{IndexError, Result};
use crate::primitives::pager::PagerOptions;
use crate::storage::btree::{Capacity, TreeOptions};
use crate::storage::recovery::{ExecutionMode, RecoveryCoordinator};
use crate::types::page::{DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

const MAX_PAGE_SIZE: u32 = 1 << 16;

/// Settings for one schema index, loadable from TOML.
///
/// ```toml
/// page_size = 8192
/// cache_pages = 1024
/// node_capacity = 64
/// verify_checksums = true
/// recovery = "background"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Page size used when the store is created.
    pub page_size: u32,
    /// Soft limit on cached pages.
    pub cache_pages: usize,
    /// Caps entries per node; applied when the store is created.
    pub node_capacity: Option<usize>,
    /// Verify page checksums on load.
    pub verify_checksums: bool,
    /// Where crash cleanup runs.
    pub recovery: ExecutionMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            node_capacity: None,
            verify_checksums: true,
            recovery: ExecutionMode::Background,
        }
    }
}

impl IndexConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| IndexError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Rejects values the pager or tree would refuse.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || self.page_size % MIN_PAGE_SIZE != 0
        {
            return Err(IndexError::Config(format!(
                "page_size {} must be a multiple of {MIN_PAGE_SIZE} up to {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(IndexError::Config("cache_pages must be positive".into()));
        }
        if let Some(capacity) = self.node_capacity {
            if capacity < Capacity::MIN {
                return Err(IndexError::Config(format!(
                    "node_capacity {capacity} is below {}",
                    Capacity::MIN
                )));
            }
        }
        Ok(())
    }

    /// Pager settings.
    pub fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            cache_pages: self.cache_pages,
            verify_checksums: self.verify_checksums,
        }
    }

    /// Tree settings.
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            node_capacity: self.node_capacity,
        }
    }

    /// A coordinator running in the configured mode.
    pub fn coordinator(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(self.recovery)
    }
}
