use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStatsSnapshot {
    /// Leaf splits performed
    pub leaf_splits: u64,
    /// Internal node splits performed
    pub internal_splits: u64,
    /// Root splits that grew the tree by one level
    pub root_splits: u64,
    /// Node merges performed
    pub merges: u64,
    /// Entries or keys borrowed from a sibling
    pub borrows: u64,
    /// Root collapses that shrank the tree by one level
    pub root_collapses: u64,
    /// Nodes copied to a new page instead of being rewritten in place
    pub cow_copies: u64,
    /// Child pointer updates written into a stable node's pointer slot
    pub pointer_slot_writes: u64,
    /// Pages taken from the end of the file
    pub pages_allocated: u64,
    /// Pages taken from the free list
    pub pages_reused: u64,
    /// Checkpoints completed
    pub checkpoints: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default, Debug)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    merges: AtomicU64,
    borrows: AtomicU64,
    root_collapses: AtomicU64,
    cow_copies: AtomicU64,
    pointer_slot_writes: AtomicU64,
    pages_allocated: AtomicU64,
    pages_reused: AtomicU64,
    checkpoints: AtomicU64,
}

impl TreeStats {
    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_borrows(&self) {
        self.borrows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cow_copies(&self) {
        self.cow_copies.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pointer_slot_writes(&self) {
        self.pointer_slot_writes
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_allocated(&self) {
        self.pages_allocated.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_pages_reused(&self) {
        self.pages_reused.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_checkpoints(&self) {
        self.checkpoints.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            root_splits: load(&self.root_splits),
            merges: load(&self.merges),
            borrows: load(&self.borrows),
            root_collapses: load(&self.root_collapses),
            cow_copies: load(&self.cow_copies),
            pointer_slot_writes: load(&self.pointer_slot_writes),
            pages_allocated: load(&self.pages_allocated),
            pages_reused: load(&self.pages_reused),
            checkpoints: load(&self.checkpoints),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "gentree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            root_splits = snapshot.root_splits,
            merges = snapshot.merges,
            borrows = snapshot.borrows,
            root_collapses = snapshot.root_collapses,
            cow_copies = snapshot.cow_copies,
            pointer_slot_writes = snapshot.pointer_slot_writes,
            pages_allocated = snapshot.pages_allocated,
            pages_reused = snapshot.pages_reused,
            checkpoints = snapshot.checkpoints,
            "tree stats snapshot"
        );
    }
}
