use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::vec;

use smallvec::SmallVec;

use super::gsp::Generations;
use super::page::{read_gsp, Node};
use super::tree::{Snapshot, TreeInner};
use super::Layout;
use crate::primitives::pager::PageIntent;
use crate::types::{PageId, Result, TreeError};

struct Frame {
    children: Vec<PageId>,
    /// Older valid slot of each child pointer.
    previous: Vec<Option<PageId>>,
    next: usize,
}

/// Lazily produced, ordered view of a key range.
///
/// A cursor observes the tree as it was published when the cursor was opened;
/// later inserts and removes are invisible until [`Cursor::rewind`]. A write in
/// flight never blocks opening or advancing a cursor. Pages are
/// read one node at a time and nothing stays pinned between calls, so a cursor
/// may be abandoned at any point.
pub struct Cursor<L: Layout> {
    tree: Arc<TreeInner<L>>,
    snapshot: Option<Snapshot>,
    lower: Bound<L::Key>,
    upper: Bound<L::Key>,
    /// Descent path; one frame per internal level.
    stack: SmallVec<[Frame; 8]>,
    leaf: Option<vec::IntoIter<(L::Key, L::Value)>>,
    started: bool,
    done: bool,
}

impl<L: Layout> Cursor<L> {
    pub(crate) fn open(tree: Arc<TreeInner<L>>, lower: Bound<L::Key>, upper: Bound<L::Key>) -> Result<Self> {
        let empty = range_is_empty(&tree.layout, &lower, &upper);
        let mut cursor = Self {
            tree,
            snapshot: None,
            lower,
            upper,
            stack: SmallVec::new(),
            leaf: None,
            started: false,
            done: empty,
        };
        if !empty {
            cursor.snapshot = Some(cursor.tree.readers.lock().register());
        }
        Ok(cursor)
    }

    pub(crate) fn empty(tree: Arc<TreeInner<L>>) -> Self {
        Self {
            tree,
            snapshot: None,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            stack: SmallVec::new(),
            leaf: None,
            started: false,
            done: true,
        }
    }

    pub(crate) fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot
    }

    /// Generation pair the cursor resolves pointers under.
    pub fn generations(&self) -> Option<Generations> {
        self.snapshot.map(|snapshot| snapshot.gens)
    }

    /// Advances the cursor and returns the next entry, if any.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(L::Key, L::Value)>> {
        if self.tree.closed.load(AtomicOrdering::Acquire) {
            return Err(TreeError::Closed);
        }
        if self.done {
            return Ok(None);
        }
        let Some(snapshot) = self.snapshot else {
            self.finish();
            return Ok(None);
        };
        if !self.started {
            self.started = true;
            self.seek_first(snapshot)?;
        }
        loop {
            if let Some((key, value)) = self.leaf.as_mut().and_then(Iterator::next) {
                if !self.below_upper(&key) {
                    self.finish();
                    return Ok(None);
                }
                return Ok(Some((key, value)));
            }
            if !self.advance_leaf(snapshot)? {
                self.finish();
                return Ok(None);
            }
        }
    }

    /// Drains the remaining entries.
    pub fn into_vec(mut self) -> Result<Vec<(L::Key, L::Value)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Restarts from the lower bound against the currently published tree.
    pub fn rewind(&mut self) -> Result<()> {
        if self.tree.closed.load(AtomicOrdering::Acquire) {
            return Err(TreeError::Closed);
        }
        self.release();
        self.stack.clear();
        self.leaf = None;
        self.started = false;
        self.done = range_is_empty(&self.tree.layout, &self.lower, &self.upper);
        if !self.done {
            self.snapshot = Some(self.tree.readers.lock().register());
        }
        Ok(())
    }

    fn load(&self, id: PageId, gens: Generations) -> Result<(Node<L>, Vec<Option<PageId>>)> {
        let cursor = self.tree.store.acquire_cursor(id, PageIntent::Read)?;
        let page = cursor.data();
        let node = Node::decode(id, page, &self.tree.layout, gens)?;
        let previous = (0..node.children.len())
            .map(|idx| Ok(read_gsp(page, idx)?.resolve_previous(gens)))
            .collect::<Result<Vec<_>>>()?;
        Ok((node, previous))
    }

    /// Loads a child, taking the pointer's older slot when the newer one leads to
    /// a page written after the snapshot was published.
    fn follow(
        &self,
        id: PageId,
        previous: Option<PageId>,
        snapshot: Snapshot,
    ) -> Result<(Node<L>, Vec<Option<PageId>>)> {
        let loaded = self.load(id, snapshot.gens)?;
        let node = &loaded.0;
        if node.generation != snapshot.gens.unstable || node.seq <= snapshot.seq {
            return Ok(loaded);
        }
        let id = previous.ok_or(TreeError::Corruption(
            "pointer to an unpublished page has no older slot",
        ))?;
        self.load(id, snapshot.gens)
    }

    fn seek_first(&mut self, snapshot: Snapshot) -> Result<()> {
        let layout = &self.tree.layout;
        let (mut node, mut previous) = self.load(snapshot.root, snapshot.gens)?;
        loop {
            if node.is_leaf() {
                let start = match &self.lower {
                    Bound::Unbounded => 0,
                    Bound::Included(key) => node
                        .keys
                        .partition_point(|probe| layout.compare(probe, key) == Ordering::Less),
                    Bound::Excluded(key) => node
                        .keys
                        .partition_point(|probe| layout.compare(probe, key) != Ordering::Greater),
                };
                self.set_leaf(node, start);
                return Ok(());
            }
            let idx = match &self.lower {
                Bound::Unbounded => 0,
                Bound::Included(key) | Bound::Excluded(key) => node.child_index(layout, key),
            };
            let (child, fallback) = (node.children[idx], previous[idx]);
            self.stack.push(Frame {
                children: node.children,
                previous,
                next: idx + 1,
            });
            (node, previous) = self.follow(child, fallback, snapshot)?;
        }
    }

    fn advance_leaf(&mut self, snapshot: Snapshot) -> Result<bool> {
        while let Some(frame) = self.stack.last_mut() {
            if frame.next < frame.children.len() {
                let mut next = (frame.children[frame.next], frame.previous[frame.next]);
                frame.next += 1;
                loop {
                    let (node, previous) = self.follow(next.0, next.1, snapshot)?;
                    if node.is_leaf() {
                        self.set_leaf(node, 0);
                        return Ok(true);
                    }
                    next = (node.children[0], previous[0]);
                    self.stack.push(Frame {
                        children: node.children,
                        previous,
                        next: 1,
                    });
                }
            }
            self.stack.pop();
        }
        Ok(false)
    }

    fn set_leaf(&mut self, node: Node<L>, start: usize) {
        let entries: Vec<_> = node
            .keys
            .into_iter()
            .zip(node.values)
            .skip(start)
            .collect();
        self.leaf = Some(entries.into_iter());
    }

    fn below_upper(&self, key: &L::Key) -> bool {
        let layout = &self.tree.layout;
        match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(limit) => layout.compare(key, limit) != Ordering::Greater,
            Bound::Excluded(limit) => layout.compare(key, limit) == Ordering::Less,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.stack.clear();
        self.leaf = None;
        self.release();
    }

    fn release(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.tree.readers.lock().unregister(snapshot.seq);
        }
    }
}

impl<L: Layout> Drop for Cursor<L> {
    fn drop(&mut self) {
        self.release();
    }
}

fn range_is_empty<L: Layout>(layout: &L, lower: &Bound<L::Key>, upper: &Bound<L::Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => layout.compare(lo, hi) == Ordering::Greater,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => layout.compare(lo, hi) != Ordering::Less,
        _ => false,
    }
}
