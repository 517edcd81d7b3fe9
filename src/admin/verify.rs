use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Debug;
use std::path::Path;

use serde::Serialize;

use crate::admin::util::open_store;
use crate::admin::{AdminError, Result};
use crate::primitives::pager::{PageIntent, PageStore};
use crate::storage::btree::gsp::Generations;
use crate::storage::btree::header::{HeaderStore, Meta};
use crate::storage::btree::page::{read_gsp, Capacity, Node, NodeHeader, NodeKind};
use crate::storage::btree::{GenTree, Layout};
use crate::types::{PageId, TreeError};

const MAX_FINDINGS: usize = 32;

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Expected after a crash and repaired by recovery.
    Warning,
    /// Structural damage.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Page the finding concerns.
    pub page: Option<u64>,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Totals gathered while walking the tree.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Root page walked.
    pub root: u64,
    /// Stable generation pointers were resolved under.
    pub stable_generation: u64,
    /// Unstable generation pointers were resolved under.
    pub unstable_generation: u64,
    /// Levels from root to leaves.
    pub height: u64,
    /// Leaf pages reached.
    pub leaf_pages: u64,
    /// Internal pages reached.
    pub internal_pages: u64,
    /// Entries stored in leaves.
    pub entries: u64,
    /// Pointer slots left by a crashed session.
    pub crash_pointers: u64,
}

/// Complete report of a verification run.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// True when no error-level finding was recorded.
    pub success: bool,
    /// Issues discovered, capped at a fixed number.
    pub findings: Vec<VerifyFinding>,
    /// Totals gathered during the walk.
    pub counts: VerifyCounts,
}

/// Verifies an open tree against the snapshot new cursors currently observe.
///
/// The walk holds a cursor registration, so concurrent writes copy pages rather
/// than changing them underneath it.
pub fn verify_tree<L: Layout>(tree: &GenTree<L>) -> Result<VerifyReport> {
    let cursor = tree.seek_range(..)?;
    let snapshot = cursor
        .snapshot()
        .ok_or_else(|| AdminError::Message("tree snapshot unavailable".into()))?;
    let report = Walk::new(
        tree.store().as_ref(),
        tree.layout(),
        snapshot.gens,
        tree.capacity(),
    )
    .run(snapshot.root)?;
    drop(cursor);
    Ok(report)
}

/// Verifies a store that no tree currently has open. Nothing is written.
///
/// Pointers are classified the way the next open would: after an unclean
/// shutdown the crashed session's generation counts as a crash leftover.
pub fn verify_store<L: Layout>(store: &dyn PageStore, layout: &L) -> Result<VerifyReport> {
    let meta = Meta::read(store)?;
    meta.check_layout(layout)?;
    let state = HeaderStore::read_slots(store)?
        .into_iter()
        .flatten()
        .max_by_key(|state| state.counter)
        .ok_or(TreeError::Corruption("no valid tree state record"))?;
    let mut gens = state.generations;
    if !state.clean {
        gens.unstable += 1;
    }
    Walk::new(store, layout, gens, meta.capacity).run(state.root)
}

/// Opens `path` and runs [`verify_store`].
pub fn verify_file<L: Layout>(path: impl AsRef<Path>, layout: &L) -> Result<VerifyReport> {
    let store = open_store(path.as_ref())?;
    verify_store(store.as_ref(), layout)
}

struct Walk<'a, L: Layout> {
    store: &'a dyn PageStore,
    layout: &'a L,
    gens: Generations,
    capacity: Capacity,
    seen: HashSet<PageId>,
    leaf_depth: Option<u64>,
    findings: Vec<VerifyFinding>,
    counts: VerifyCounts,
}

impl<'a, L: Layout> Walk<'a, L> {
    fn new(store: &'a dyn PageStore, layout: &'a L, gens: Generations, capacity: Capacity) -> Self {
        Self {
            store,
            layout,
            gens,
            capacity,
            seen: HashSet::new(),
            leaf_depth: None,
            findings: Vec::new(),
            counts: VerifyCounts {
                stable_generation: gens.stable,
                unstable_generation: gens.unstable,
                ..VerifyCounts::default()
            },
        }
    }

    fn run(mut self, root: PageId) -> Result<VerifyReport> {
        self.counts.root = root.0;
        self.visit(root, 1, None, None, true)?;
        self.counts.height = self.leaf_depth.unwrap_or(0);
        if self.counts.crash_pointers > 0 {
            let message = format!(
                "{} crash pointer slot(s) awaiting cleanup",
                self.counts.crash_pointers
            );
            self.push(VerifySeverity::Warning, None, message);
        }
        Ok(VerifyReport {
            success: !self
                .findings
                .iter()
                .any(|finding| finding.severity == VerifySeverity::Error),
            findings: self.findings,
            counts: self.counts,
        })
    }

    fn push(&mut self, severity: VerifySeverity, page: Option<PageId>, message: String) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(VerifyFinding {
                severity,
                page: page.map(|id| id.0),
                message,
            });
        }
    }

    fn error(&mut self, page: PageId, message: impl Into<String>) {
        self.push(VerifySeverity::Error, Some(page), message.into());
    }

    fn read(&self, id: PageId) -> crate::types::Result<(Node<L>, u64)> {
        let cursor = self.store.acquire_cursor(id, PageIntent::Read)?;
        let page = cursor.data();
        let header = NodeHeader::parse(page)?;
        let mut crashed = 0u64;
        if header.kind == NodeKind::Internal {
            for idx in 0..=header.key_count {
                crashed += read_gsp(page, idx)?.crashed_slots(self.gens) as u64;
            }
        }
        let node = Node::decode(id, page, self.layout, self.gens)?;
        Ok((node, crashed))
    }

    fn visit(
        &mut self,
        id: PageId,
        depth: u64,
        lower: Option<&L::Key>,
        upper: Option<&L::Key>,
        is_root: bool,
    ) -> Result<()> {
        if !self.seen.insert(id) {
            self.error(id, "page reachable more than once");
            return Ok(());
        }
        let (node, crashed) = match self.read(id) {
            Ok(read) => read,
            Err(err) if err.is_corruption() => {
                self.error(id, err.to_string());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.counts.crash_pointers += crashed;

        if node.generation > self.gens.unstable
            || (node.generation > self.gens.stable && node.generation < self.gens.unstable)
        {
            self.error(
                id,
                format!(
                    "generation {} outside the visible range {}..={}",
                    node.generation, self.gens.stable, self.gens.unstable
                ),
            );
        }
        self.check_keys(&node, lower, upper);

        let (limit, min) = if node.is_leaf() {
            (self.capacity.leaf, self.capacity.min_leaf())
        } else {
            (self.capacity.internal, self.capacity.min_internal())
        };
        if node.keys.len() > limit {
            self.error(id, format!("{} keys exceed capacity {limit}", node.keys.len()));
        }
        if !is_root && node.keys.len() < min {
            self.error(id, format!("{} keys below minimum fill {min}", node.keys.len()));
        }

        if node.is_leaf() {
            self.counts.leaf_pages += 1;
            self.counts.entries += node.keys.len() as u64;
            match self.leaf_depth {
                None => self.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    self.error(id, format!("leaf at depth {depth}, expected {expected}"));
                }
                Some(_) => {}
            }
            return Ok(());
        }

        self.counts.internal_pages += 1;
        for (idx, child) in node.children.iter().enumerate() {
            let child_lower = if idx == 0 { lower } else { node.keys.get(idx - 1) };
            let child_upper = node.keys.get(idx).or(upper);
            self.visit(*child, depth + 1, child_lower, child_upper, false)?;
        }
        Ok(())
    }

    /// Keys strictly ascending and inside `[lower, upper)`.
    fn check_keys(&mut self, node: &Node<L>, lower: Option<&L::Key>, upper: Option<&L::Key>) {
        let layout = self.layout;
        if let Some(pair) = node
            .keys
            .windows(2)
            .find(|pair| layout.compare(&pair[0], &pair[1]) != Ordering::Less)
        {
            self.error(node.id, format!("keys out of order: {}", describe(pair)));
        }
        if let Some(lower) = lower {
            if let Some(key) = node
                .keys
                .iter()
                .find(|key| layout.compare(key, lower) == Ordering::Less)
            {
                self.error(node.id, format!("key {key:?} below separator {lower:?}"));
            }
        }
        if let Some(upper) = upper {
            if let Some(key) = node
                .keys
                .iter()
                .find(|key| layout.compare(key, upper) != Ordering::Less)
            {
                self.error(node.id, format!("key {key:?} not below separator {upper:?}"));
            }
        }
    }
}

fn describe<K: Debug>(pair: &[K]) -> String {
    format!("{:?} then {:?}", pair[0], pair[1])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::primitives::pager::{Pager, PagerOptions};
    use crate::storage::btree::{NoopMonitor, TreeOptions, U64Layout};
    use crate::storage::recovery::RecoveryCoordinator;

    fn small_tree(path: &Path) -> crate::types::Result<GenTree<U64Layout>> {
        let options = PagerOptions {
            page_size: 512,
            ..PagerOptions::default()
        };
        let store = Arc::new(Pager::open(path, options)?);
        GenTree::open(
            store,
            U64Layout,
            TreeOptions {
                node_capacity: Some(4),
            },
            |_| {},
            &RecoveryCoordinator::immediate(),
            Arc::new(NoopMonitor),
        )
    }

    #[test]
    fn healthy_tree_verifies_online_and_offline() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("v.gt");
        let tree = small_tree(&path)?;
        for key in 0..200u64 {
            tree.insert(key * 7 % 211, key)?;
        }
        for key in (0..200u64).step_by(3) {
            tree.remove(&(key * 7 % 211))?;
        }
        let online = verify_tree(&tree)?;
        assert!(online.success, "{:?}", online.findings);
        assert!(online.counts.height >= 3);
        assert_eq!(online.counts.entries, 200 - 67);
        tree.close()?;
        drop(tree);

        let offline = verify_file(&path, &U64Layout)?;
        assert!(offline.success, "{:?}", offline.findings);
        assert_eq!(offline.counts.entries, 200 - 67);
        assert_eq!(offline.counts.crash_pointers, 0);
        Ok(())
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempdir().unwrap();
        let err = verify_file(dir.path().join("absent.gt"), &U64Layout).unwrap_err();
        assert!(matches!(err, AdminError::MissingStore(_)));
    }
}
