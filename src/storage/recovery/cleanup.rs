use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::{CleanupJob, CleanupProgress};
use crate::primitives::pager::{PageIntent, PageStore};
use crate::storage::btree::gsp::Generations;
use crate::storage::btree::page::{read_gsp, write_gsp, NodeHeader, NodeKind};
use crate::types::{PageId, Result, TreeError};

/// Walks the stable tree and zeroes pointer slots left behind by a crashed session.
///
/// Only nodes at or below the stable generation are visited; anything newer was
/// written by the current session and cannot hold crash pointers. Running the
/// pass twice is harmless: the second run finds nothing to clean.
pub struct CrashCleanup {
    store: Arc<dyn PageStore>,
    root: PageId,
    gens: Generations,
}

impl CrashCleanup {
    /// Cleanup rooted at the last checkpointed root, classifying slots under `gens`.
    pub fn new(store: Arc<dyn PageStore>, root: PageId, gens: Generations) -> Self {
        Self { store, root, gens }
    }

    /// Reads `id`, returning its stable children and whether any slot needs cleaning.
    fn scan(&self, id: PageId, progress: &CleanupProgress) -> Result<(Vec<PageId>, bool)> {
        let cursor = self.store.acquire_cursor(id, PageIntent::Read)?;
        let page = cursor.data();
        let header = NodeHeader::parse(page)?;
        progress.page_visited();
        if !self.gens.is_stable(header.generation) || header.kind == NodeKind::Leaf {
            return Ok((Vec::new(), false));
        }
        let mut children = Vec::with_capacity(header.key_count + 1);
        let mut dirty = false;
        for idx in 0..=header.key_count {
            let gsp = read_gsp(page, idx)?;
            dirty |= gsp.crashed_slots(self.gens) > 0;
            children.push(gsp.resolve_stable(self.gens)?);
        }
        Ok((children, dirty))
    }

    fn repair(&self, id: PageId) -> Result<u64> {
        let mut cursor = self.store.acquire_cursor(id, PageIntent::Write)?;
        let page = cursor.data_mut()?;
        let header = NodeHeader::parse(page)?;
        if header.kind != NodeKind::Internal || !self.gens.is_stable(header.generation) {
            return Ok(0);
        }
        let mut cleaned = 0u64;
        for idx in 0..=header.key_count {
            let mut gsp = read_gsp(page, idx)?;
            let count = gsp.clean(self.gens);
            if count > 0 {
                write_gsp(page, idx, &gsp)?;
                cleaned += count as u64;
            }
        }
        Ok(cleaned)
    }
}

impl CleanupJob for CrashCleanup {
    fn describe(&self) -> String {
        format!(
            "crash pointer cleanup from root {} (stable {}, unstable {})",
            self.root, self.gens.stable, self.gens.unstable
        )
    }

    fn run(&mut self, progress: &CleanupProgress) -> Result<()> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                return Err(TreeError::Corruption("stable tree reaches a page twice"));
            }
            let (children, dirty) = self.scan(id, progress)?;
            if dirty {
                let cleaned = self.repair(id)?;
                if cleaned > 0 {
                    debug!(page = id.0, cleaned, "gentree.recovery.pointers_cleaned");
                    progress.pointers_cleaned_by(cleaned);
                }
            }
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }
}
