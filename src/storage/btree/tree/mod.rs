//! Generation-stamped copy-on-write B+ tree.
//!
//! One writer and any number of cursors share a [`GenTree`]. Writes are
//! stamped with the unstable generation; a checkpoint publishes that generation
//! as stable. Pages reachable from the published tree are never rewritten:
//! they are copied, or, when no cursor is open, a stable parent takes an
//! in-place write of the pointer slot for the unstable generation. Writers
//! never hold the reader table while they work, so cursors open without
//! waiting. A crash leaves the stable tree intact, with at most some pointer
//! slots that the recovery pass zeroes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::cursor::Cursor;
use super::freelist::{free_page_capacity, read_free_page, write_free_page, FreeEntry, FreeList};
use super::gsp::Generations;
use super::header::{HeaderStore, Meta, TreeState, FIRST_DATA_PAGE};
use super::monitor::TreeMonitor;
use super::page::{Capacity, Node, NodeHeader};
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::Layout;
use crate::primitives::pager::{PageIntent, PageStore};
use crate::storage::recovery::{CleanupHandle, CrashCleanup, RecoveryCoordinator};
use crate::types::{PageId, Result, TreeError};

mod insert;
mod remove;
mod write;

use write::{WriteOp, WriterState};

/// Tuning knobs applied when a store is created.
#[derive(Clone, Debug, Default)]
pub struct TreeOptions {
    /// Caps entries per leaf and keys per internal node below what fits in a page.
    /// Stored in the meta page; later opens use the stored value.
    pub node_capacity: Option<usize>,
}

/// Tree view a cursor or writer operates on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Snapshot {
    pub(crate) root: PageId,
    pub(crate) seq: u64,
    pub(crate) gens: Generations,
}

/// Published tree view plus the registration sequence of every live cursor.
pub(crate) struct ReaderTable {
    pub(crate) current: Snapshot,
    active: BTreeMap<u64, usize>,
}

impl ReaderTable {
    pub(crate) fn register(&mut self) -> Snapshot {
        *self.active.entry(self.current.seq).or_insert(0) += 1;
        self.current
    }

    pub(crate) fn unregister(&mut self, seq: u64) {
        if let Some(count) = self.active.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&seq);
            }
        }
    }

    fn oldest(&self) -> Option<u64> {
        self.active.keys().next().copied()
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty()
    }
}

pub(crate) struct TreeInner<L: Layout> {
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) layout: L,
    pub(crate) salt: u64,
    pub(crate) capacity: Capacity,
    writer: Mutex<WriterState>,
    pub(crate) readers: Mutex<ReaderTable>,
    pub(crate) closed: AtomicBool,
    degraded: Mutex<Option<String>>,
    payload: Mutex<Vec<u8>>,
    cleanup: Mutex<Option<CleanupHandle>>,
    monitor: Arc<dyn TreeMonitor>,
    pub(crate) stats: TreeStats,
}

/// Handle to an open tree. Clones share the same tree.
pub struct GenTree<L: Layout> {
    inner: Arc<TreeInner<L>>,
}

impl<L: Layout> Clone for GenTree<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Layout> GenTree<L> {
    /// Opens the tree stored in `store`, creating it when the store is empty.
    ///
    /// `header_writer` fills the caller payload and runs only when the store is
    /// created. If the previous session did not close cleanly, a crash-pointer
    /// cleanup pass is scheduled on `coordinator`; its events go to `monitor`.
    pub fn open<F>(
        store: Arc<dyn PageStore>,
        layout: L,
        options: TreeOptions,
        header_writer: F,
        coordinator: &RecoveryCoordinator,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Result<Self>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        if store.page_count() == 0 {
            Self::create(store, layout, options, header_writer, monitor)
        } else {
            Self::load(store, layout, coordinator, monitor)
        }
    }

    fn create<F>(
        store: Arc<dyn PageStore>,
        layout: L,
        options: TreeOptions,
        header_writer: F,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Result<Self>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        monitor.no_store_file();
        let page_size = store.page_size();
        let salt = store.salt();
        let capacity = Capacity::for_layout(&layout, page_size, options.node_capacity)?;
        let mut payload = Vec::new();
        header_writer(&mut payload);
        if payload.len() > TreeState::max_payload(page_size) {
            return Err(TreeError::Invalid("header payload does not fit in a state page"));
        }

        Meta::for_layout(&layout, page_size, salt, capacity).write(store.as_ref())?;
        let initial = Generations {
            stable: 1,
            unstable: 2,
        };
        let root = PageId(FIRST_DATA_PAGE);
        {
            let leaf = Node::<L>::new_leaf(root, initial.unstable, 0);
            let mut cursor = store.acquire_cursor(root, PageIntent::Write)?;
            leaf.encode(cursor.data_mut()?, &layout, salt)?;
        }
        store.flush()?;

        let mut header = HeaderStore::create(Arc::clone(&store));
        let mut state = TreeState {
            counter: 0,
            generations: initial.advanced(),
            root,
            root_generation: initial.unstable,
            next_page: FIRST_DATA_PAGE + 1,
            free_list_head: PageId(0),
            clean: false,
            payload,
        };
        header.write(&mut state)?;
        store.flush()?;
        info!(
            page_size,
            leaf_capacity = capacity.leaf,
            internal_capacity = capacity.internal,
            "gentree.tree.created"
        );
        Ok(Self::assemble(
            store,
            layout,
            capacity,
            header,
            state,
            FreeList::default(),
            Vec::new(),
            monitor,
        ))
    }

    fn load(
        store: Arc<dyn PageStore>,
        layout: L,
        coordinator: &RecoveryCoordinator,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Result<Self> {
        let meta = Meta::read(store.as_ref())?;
        meta.check_layout(&layout)?;
        let ceiling = Capacity::for_layout(&layout, meta.page_size, None)?;
        if meta.capacity.validate().is_err()
            || meta.capacity.leaf > ceiling.leaf
            || meta.capacity.internal > ceiling.internal
        {
            return Err(TreeError::Corruption("stored node capacity does not fit the page"));
        }

        let (mut header, mut state) = HeaderStore::load(Arc::clone(&store))?;
        let was_clean = state.clean;
        monitor.startup_state(was_clean);
        let persisted = state.generations;
        // A crashed session may have stamped pages with its unstable generation;
        // skipping it keeps those pages classified as crash leftovers.
        let gens = if was_clean {
            persisted
        } else {
            Generations {
                stable: persisted.stable,
                unstable: persisted.unstable + 1,
            }
        };
        let (free, chain) = load_free_list(store.as_ref(), state.free_list_head, state.next_page)?;

        state.generations = gens;
        state.clean = false;
        header.write(&mut state)?;
        store.flush()?;
        info!(
            clean = was_clean,
            stable = gens.stable,
            unstable = gens.unstable,
            root = state.root.0,
            free_pages = free.len(),
            "gentree.tree.opened"
        );

        let stable_root = state.root;
        let tree = Self::assemble(
            store,
            layout,
            meta.capacity,
            header,
            state,
            free,
            chain,
            monitor,
        );
        if !was_clean {
            let job = CrashCleanup::new(Arc::clone(&tree.inner.store), stable_root, gens);
            let handle = coordinator.schedule(Box::new(job), Arc::clone(&tree.inner.monitor));
            *tree.inner.cleanup.lock() = Some(handle);
        }
        Ok(tree)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        store: Arc<dyn PageStore>,
        layout: L,
        capacity: Capacity,
        header: HeaderStore,
        state: TreeState,
        free: FreeList,
        free_chain: Vec<PageId>,
        monitor: Arc<dyn TreeMonitor>,
    ) -> Self {
        let snapshot = Snapshot {
            root: state.root,
            seq: 0,
            gens: state.generations,
        };
        let salt = store.salt();
        let writer = WriterState {
            root: state.root,
            gens: state.generations,
            next_page: state.next_page,
            free,
            free_chain,
            header,
        };
        Self {
            inner: Arc::new(TreeInner {
                store,
                layout,
                salt,
                capacity,
                writer: Mutex::new(writer),
                readers: Mutex::new(ReaderTable {
                    current: snapshot,
                    active: BTreeMap::new(),
                }),
                closed: AtomicBool::new(false),
                degraded: Mutex::new(None),
                payload: Mutex::new(state.payload),
                cleanup: Mutex::new(None),
                monitor,
                stats: TreeStats::default(),
            }),
        }
    }

    /// Fails with [`TreeError::Closed`] once the tree has been closed.
    pub fn assert_open(&self) -> Result<()> {
        if self.inner.closed.load(AtomicOrdering::Acquire) {
            return Err(TreeError::Closed);
        }
        Ok(())
    }

    /// True once [`GenTree::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::Acquire)
    }

    /// The layout keys and values are encoded with.
    pub fn layout(&self) -> &L {
        &self.inner.layout
    }

    /// Node capacities in effect.
    pub fn capacity(&self) -> Capacity {
        self.inner.capacity
    }

    /// The page store backing the tree.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.inner.store
    }

    /// Generation pair new cursors observe.
    pub fn generations(&self) -> Generations {
        self.inner.readers.lock().current.gens
    }

    /// Root page new cursors start from.
    pub fn root(&self) -> PageId {
        self.inner.readers.lock().current.root
    }

    /// Caller payload stored in the header.
    pub fn header(&self) -> Vec<u8> {
        self.inner.payload.lock().clone()
    }

    /// Handle to the cleanup pass scheduled at open, if the last session crashed.
    pub fn cleanup_handle(&self) -> Option<CleanupHandle> {
        self.inner.cleanup.lock().clone()
    }

    /// Reason the tree refuses writes, if a write failed midway.
    pub fn degraded(&self) -> Option<String> {
        self.inner.degraded.lock().clone()
    }

    /// Operation counters.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Emits operation counters through `tracing`.
    pub fn emit_stats(&self) {
        self.inner.stats.emit_tracing();
    }

    /// Cursor over `[from, to)`, or `[from, to]` when `to` is the layout's
    /// highest key. Empty when `from` is not below `to`.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Cursor<L>> {
        self.assert_open()?;
        let layout = &self.inner.layout;
        if layout.compare(from, to) != Ordering::Less {
            return Ok(Cursor::empty(Arc::clone(&self.inner)));
        }
        // The highest sentinel is itself a storable key.
        let upper = if layout.compare(to, &layout.highest_key()) == Ordering::Equal {
            Bound::Included(to.clone())
        } else {
            Bound::Excluded(to.clone())
        };
        Cursor::open(Arc::clone(&self.inner), Bound::Included(from.clone()), upper)
    }

    /// Cursor over an arbitrary key range.
    pub fn seek_range<R: RangeBounds<L::Key>>(&self, range: R) -> Result<Cursor<L>> {
        self.assert_open()?;
        Cursor::open(
            Arc::clone(&self.inner),
            range.start_bound().cloned(),
            range.end_bound().cloned(),
        )
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut cursor = self.seek_range((Bound::Included(key), Bound::Included(key)))?;
        Ok(cursor.next()?.map(|(_, value)| value))
    }

    /// Inserts `key`, replacing any existing value.
    pub fn insert(&self, key: L::Key, value: L::Value) -> Result<()> {
        self.assert_open()?;
        let layout = &self.inner.layout;
        if layout.key_size(&key) > layout.max_key_size()
            || layout.value_size(&value) > layout.max_value_size()
        {
            return Err(TreeError::Invalid("entry exceeds the layout's maximum size"));
        }
        self.write(|op| op.insert(key, value))
    }

    /// Removes `key`, returning its value when it was present.
    pub fn remove(&self, key: &L::Key) -> Result<Option<L::Value>> {
        self.assert_open()?;
        self.write(|op| op.remove(key))
    }

    fn write<T>(&self, apply: impl FnOnce(&mut WriteOp<'_, L>) -> Result<T>) -> Result<T> {
        let mut writer = self
            .inner
            .writer
            .try_lock()
            .ok_or(TreeError::ConcurrentWriter)?;
        self.check_degraded()?;
        let (seq, oldest_reader, exclusive) = {
            let table = self.inner.readers.lock();
            (table.current.seq + 1, table.oldest(), table.is_idle())
        };
        let result = {
            let mut op = WriteOp::new(&self.inner, &mut writer, seq, exclusive, oldest_reader);
            apply(&mut op)
        };
        match result {
            Ok(value) => {
                self.inner.readers.lock().current = Snapshot {
                    root: writer.root,
                    seq,
                    gens: writer.gens,
                };
                Ok(value)
            }
            Err(err) => {
                self.degrade(&err);
                Err(err)
            }
        }
    }

    fn degrade(&self, err: &TreeError) {
        warn!(error = %err, "gentree.tree.degraded");
        let mut degraded = self.inner.degraded.lock();
        if degraded.is_none() {
            *degraded = Some(err.to_string());
        }
    }

    fn check_degraded(&self) -> Result<()> {
        match self.inner.degraded.lock().as_ref() {
            Some(reason) => Err(TreeError::Degraded(reason.clone())),
            None => Ok(()),
        }
    }

    /// Publishes the current unstable generation as stable.
    ///
    /// Waits for a pending cleanup pass first; a failed pass fails the
    /// checkpoint with [`TreeError::RecoveryFailed`].
    pub fn checkpoint(&self) -> Result<()> {
        self.assert_open()?;
        let mut writer = self
            .inner
            .writer
            .try_lock()
            .ok_or(TreeError::ConcurrentWriter)?;
        self.check_degraded()?;
        self.checkpoint_locked(&mut writer, None)
    }

    /// Checkpoints after letting `rewrite` edit the header payload.
    pub fn checkpoint_with_header<F>(&self, rewrite: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        self.assert_open()?;
        let mut writer = self
            .inner
            .writer
            .try_lock()
            .ok_or(TreeError::ConcurrentWriter)?;
        self.check_degraded()?;
        let mut payload = self.header();
        rewrite(&mut payload);
        if payload.len() > TreeState::max_payload(self.inner.store.page_size()) {
            return Err(TreeError::Invalid("header payload does not fit in a state page"));
        }
        self.checkpoint_locked(&mut writer, Some(payload))
    }

    fn await_cleanup(&self) -> Result<()> {
        let handle = self.inner.cleanup.lock().clone();
        if let Some(handle) = handle {
            handle.wait()?;
        }
        Ok(())
    }

    fn checkpoint_locked(&self, writer: &mut WriterState, payload: Option<Vec<u8>>) -> Result<()> {
        self.await_cleanup()?;
        let store = &self.inner.store;
        let next = writer.gens.advanced();
        self.persist_free_list(writer, next)?;
        store.flush()?;

        if let Some(payload) = payload {
            *self.inner.payload.lock() = payload;
        }
        let mut state = self.state_record(writer, next, false)?;
        writer.header.write(&mut state)?;
        store.flush()?;

        writer.gens = next;
        self.inner.readers.lock().current.gens = next;
        self.inner.monitor.checkpoint_completed(next.stable);
        self.inner.stats.inc_checkpoints();
        debug!(
            stable = next.stable,
            unstable = next.unstable,
            root = writer.root.0,
            next_page = writer.next_page,
            free_pages = writer.free.len(),
            "gentree.checkpoint.complete"
        );
        Ok(())
    }

    fn state_record(&self, writer: &WriterState, gens: Generations, clean: bool) -> Result<TreeState> {
        let root_generation = {
            let cursor = self
                .inner
                .store
                .acquire_cursor(writer.root, PageIntent::Read)?;
            NodeHeader::parse(cursor.data())?.generation
        };
        Ok(TreeState {
            counter: 0,
            generations: gens,
            root: writer.root,
            root_generation,
            next_page: writer.next_page,
            free_list_head: writer.free_chain.first().copied().unwrap_or_default(),
            clean,
            payload: self.inner.payload.lock().clone(),
        })
    }

    /// Writes the free list as a fresh chain of pages.
    ///
    /// The previous chain stays referenced by the current state record until the
    /// new one is durable, so its pages are released for reuse only after `next`
    /// becomes stable.
    fn persist_free_list(&self, writer: &mut WriterState, next: Generations) -> Result<()> {
        let per_page = free_page_capacity(self.inner.store.page_size() as usize);
        for id in std::mem::take(&mut writer.free_chain) {
            writer.free.release(id, next.stable, 0);
        }
        let (seq, oldest_reader) = {
            let table = self.inner.readers.lock();
            (table.current.seq + 1, table.oldest())
        };
        let mut chain = Vec::new();
        while chain.len() * per_page < writer.free.len() {
            chain.push(writer.allocate(&self.inner.stats, seq, oldest_reader));
        }
        let entries: Vec<FreeEntry> = writer.free.iter().copied().collect();
        for (idx, id) in chain.iter().enumerate() {
            let start = (idx * per_page).min(entries.len());
            let end = ((idx + 1) * per_page).min(entries.len());
            let next_page = chain.get(idx + 1).copied().unwrap_or_default();
            let mut cursor = self.inner.store.acquire_cursor(*id, PageIntent::Write)?;
            write_free_page(
                cursor.data_mut()?,
                *id,
                self.inner.salt,
                next_page,
                &entries[start..end],
            )?;
        }
        writer.free_chain = chain;
        Ok(())
    }

    /// Checkpoints, marks the store clean and refuses further use.
    ///
    /// This is the only place the clean flag is written; a completed cleanup
    /// pass leaves the store marked unclean until `close`.
    ///
    /// A tree whose cleanup pass failed, or whose last write failed midway, is
    /// closed without a checkpoint so the next open recovers from the last
    /// published generation. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock();
        if let Some(reason) = self.degraded() {
            warn!(reason = %reason, "gentree.tree.close_without_checkpoint");
            return Ok(());
        }
        if let Err(err) = self.await_cleanup() {
            warn!(error = %err, "gentree.tree.close_without_checkpoint");
            return Ok(());
        }
        self.checkpoint_locked(&mut writer, None)?;
        let gens = writer.gens;
        let mut state = self.state_record(&writer, gens, true)?;
        writer.header.write(&mut state)?;
        self.inner.store.flush()?;
        info!(stable = gens.stable, root = writer.root.0, "gentree.tree.closed");
        Ok(())
    }
}

impl<L: Layout> fmt::Debug for GenTree<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.inner.readers.lock().current;
        f.debug_struct("GenTree")
            .field("root", &snapshot.root)
            .field("generations", &snapshot.gens)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn load_free_list(
    store: &dyn PageStore,
    head: PageId,
    next_page: u64,
) -> Result<(FreeList, Vec<PageId>)> {
    let mut entries = Vec::new();
    let mut chain = Vec::new();
    let mut id = head;
    while id.0 != 0 {
        if id.0 < FIRST_DATA_PAGE || id.0 >= next_page || chain.len() as u64 >= next_page {
            return Err(TreeError::Corruption("free list chain out of range"));
        }
        let cursor = store.acquire_cursor(id, PageIntent::Read)?;
        let page = read_free_page(cursor.data())?;
        entries.extend(page.entries);
        chain.push(id);
        id = page.next;
    }
    Ok((FreeList::from_entries(entries), chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{Pager, PagerOptions};
    use crate::storage::btree::{NoopMonitor, U64Layout};

    #[test]
    fn overlapping_writer_is_detected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(Pager::open(dir.path().join("cw.gt"), PagerOptions::default())?);
        let tree = GenTree::open(
            store,
            U64Layout,
            TreeOptions::default(),
            |_| {},
            &RecoveryCoordinator::immediate(),
            Arc::new(NoopMonitor),
        )?;
        {
            let _held = tree.inner.writer.lock();
            assert!(matches!(tree.insert(1, 1), Err(TreeError::ConcurrentWriter)));
            assert!(matches!(tree.checkpoint(), Err(TreeError::ConcurrentWriter)));
        }
        assert!(tree.degraded().is_none());
        tree.insert(1, 1)?;
        assert_eq!(tree.get(&1)?, Some(1));
        Ok(())
    }

    /// Opens a cursor on `published` as if it registered while the next write ran.
    fn cursor_at(tree: &GenTree<U64Layout>, published: Snapshot) -> Result<Cursor<U64Layout>> {
        let latest = std::mem::replace(&mut tree.inner.readers.lock().current, published);
        let cursor = tree.seek_range(..);
        tree.inner.readers.lock().current = latest;
        cursor
    }

    #[test]
    fn cursor_registered_mid_write_skips_unpublished_slots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(Pager::open(dir.path().join("mid.gt"), PagerOptions::default())?);
        let tree = GenTree::open(
            store,
            U64Layout,
            TreeOptions {
                node_capacity: Some(4),
            },
            |_| {},
            &RecoveryCoordinator::immediate(),
            Arc::new(NoopMonitor),
        )?;
        for key in 0..40u64 {
            tree.insert(key, key)?;
        }
        tree.checkpoint()?;

        let before_first = tree.inner.readers.lock().current;
        tree.insert(5, 500)?;
        assert!(tree.stats().pointer_slot_writes > 0);
        let seen = cursor_at(&tree, before_first)?.into_vec()?;
        assert_eq!(seen, (0..40u64).map(|key| (key, key)).collect::<Vec<_>>());

        // The leaf's parent now holds a published unstable slot; the next write
        // to that leaf must not overwrite it.
        let before_second = tree.inner.readers.lock().current;
        let slot_writes = tree.stats().pointer_slot_writes;
        tree.insert(5, 501)?;
        assert!(tree.stats().cow_copies > 0);
        assert!(tree.stats().pointer_slot_writes > slot_writes);
        let seen = cursor_at(&tree, before_second)?.into_vec()?;
        assert_eq!(seen.len(), 40);
        assert!(seen.contains(&(5, 500)));

        assert_eq!(tree.get(&5)?, Some(501));
        tree.close()
    }
}
