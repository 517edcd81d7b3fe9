use tracing::trace;

use super::TreeInner;
use crate::primitives::pager::PageIntent;
use crate::storage::btree::freelist::FreeList;
use crate::storage::btree::gsp::Generations;
use crate::storage::btree::header::HeaderStore;
use crate::storage::btree::page::{read_gsp, write_gsp, Node};
use crate::storage::btree::stats::TreeStats;
use crate::storage::btree::Layout;
use crate::types::{PageId, Result};

/// State owned by the single writer.
pub(crate) struct WriterState {
    pub(crate) root: PageId,
    pub(crate) gens: Generations,
    pub(crate) next_page: u64,
    pub(crate) free: FreeList,
    pub(crate) free_chain: Vec<PageId>,
    pub(crate) header: HeaderStore,
}

impl WriterState {
    /// Takes a reusable page from the free list or extends the file.
    pub(crate) fn allocate(&mut self, stats: &TreeStats, seq: u64, oldest_reader: Option<u64>) -> PageId {
        if let Some(id) = self.free.take(self.gens.stable, seq, oldest_reader) {
            stats.inc_pages_reused();
            return id;
        }
        let id = PageId(self.next_page);
        self.next_page += 1;
        stats.inc_pages_allocated();
        id
    }
}

/// One insert or remove in progress.
///
/// Cursors may register while the operation runs and keep reading the last
/// published tree, so only pages written by this very operation are rewritten
/// in place. Every other node is copied. When no cursor was registered at the
/// start (`exclusive`), a stable parent may instead take an in-place write of
/// a pointer slot that still resolves to its stable child; cursors that land on
/// a page newer than their snapshot follow the other slot.
pub(crate) struct WriteOp<'a, L: Layout> {
    pub(super) tree: &'a TreeInner<L>,
    pub(super) writer: &'a mut WriterState,
    pub(super) seq: u64,
    exclusive: bool,
    oldest_reader: Option<u64>,
    /// Pointer slots this operation wrote in place, as `(parent, child index)`.
    slot_writes: Vec<(PageId, usize)>,
}

impl<'a, L: Layout> WriteOp<'a, L> {
    pub(super) fn new(
        tree: &'a TreeInner<L>,
        writer: &'a mut WriterState,
        seq: u64,
        exclusive: bool,
        oldest_reader: Option<u64>,
    ) -> Self {
        Self {
            tree,
            writer,
            seq,
            exclusive,
            oldest_reader,
            slot_writes: Vec::new(),
        }
    }

    pub(super) fn gens(&self) -> Generations {
        self.writer.gens
    }

    pub(super) fn load(&self, id: PageId) -> Result<Node<L>> {
        let cursor = self.tree.store.acquire_cursor(id, PageIntent::Read)?;
        Node::decode(id, cursor.data(), &self.tree.layout, self.writer.gens)
    }

    fn is_mutable(&self, node: &Node<L>) -> bool {
        node.generation == self.writer.gens.unstable && node.seq == self.seq
    }

    pub(super) fn allocate(&mut self) -> PageId {
        self.writer
            .allocate(&self.tree.stats, self.seq, self.oldest_reader)
    }

    /// Returns `id` to the free list. Pages of the stable tree stay reserved
    /// until the current unstable generation is checkpointed.
    pub(super) fn release(&mut self, id: PageId, generation: u64) {
        let gens = self.writer.gens;
        let reuse_after = if gens.is_stable(generation) {
            gens.unstable
        } else {
            gens.stable
        };
        self.writer.free.release(id, reuse_after, self.seq);
    }

    /// Empty leaf on a fresh page, owned by this operation.
    pub(super) fn new_leaf(&mut self) -> Node<L> {
        let id = self.allocate();
        Node::new_leaf(id, self.writer.gens.unstable, self.seq)
    }

    /// Internal node on a fresh page, owned by this operation.
    pub(super) fn new_internal(&mut self) -> Node<L> {
        let id = self.allocate();
        Node::new_internal(id, self.writer.gens.unstable, self.seq)
    }

    /// Writes `node`, copying it to a fresh page unless it may change in place.
    /// Returns the page now holding the node.
    pub(super) fn persist(&mut self, mut node: Node<L>) -> Result<PageId> {
        if !self.is_mutable(&node) {
            let old = node.id;
            let old_generation = node.generation;
            node.id = self.allocate();
            node.generation = self.writer.gens.unstable;
            node.seq = self.seq;
            self.release(old, old_generation);
            self.tree.stats.inc_cow_copies();
            trace!(from = old.0, to = node.id.0, "gentree.tree.cow_copy");
        }
        self.write_node(&node)?;
        Ok(node.id)
    }

    fn write_node(&self, node: &Node<L>) -> Result<()> {
        let mut cursor = self
            .tree
            .store
            .acquire_cursor(node.id, PageIntent::Write)?;
        node.encode(cursor.data_mut()?, &self.tree.layout, self.tree.salt)
    }

    /// Points child `idx` of `parent` at `child`, returning the parent's page.
    ///
    /// A stable parent with no cursor open keeps its page when the slot still
    /// resolves to the stable child (or was written earlier by this operation):
    /// only the pointer slot for the unstable generation is written, leaving the
    /// stable slot intact.
    pub(super) fn repoint(&mut self, mut parent: Node<L>, idx: usize, child: PageId) -> Result<PageId> {
        if parent.children[idx] == child {
            return Ok(parent.id);
        }
        parent.children[idx] = child;
        let gens = self.writer.gens;
        if self.exclusive && gens.is_stable(parent.generation) && self.write_slot(parent.id, idx, child)? {
            return Ok(parent.id);
        }
        self.persist(parent)
    }

    fn write_slot(&mut self, parent: PageId, idx: usize, child: PageId) -> Result<bool> {
        let gens = self.writer.gens;
        let own = self.slot_writes.contains(&(parent, idx));
        let mut cursor = self.tree.store.acquire_cursor(parent, PageIntent::Write)?;
        let page = cursor.data_mut()?;
        let mut gsp = read_gsp(page, idx)?;
        // A published unstable slot is the only path to its child for cursors
        // that opened before this operation.
        if !own && gsp.has_unstable(gens) {
            return Ok(false);
        }
        gsp.write(child, gens);
        write_gsp(page, idx, &gsp)?;
        if !own {
            self.slot_writes.push((parent, idx));
        }
        self.tree.stats.inc_pointer_slot_writes();
        Ok(true)
    }

    /// Fewest keys `node` may hold when it is not the root.
    pub(super) fn min_len(&self, node: &Node<L>) -> usize {
        if node.is_leaf() {
            self.tree.capacity.min_leaf()
        } else {
            self.tree.capacity.min_internal()
        }
    }
}
