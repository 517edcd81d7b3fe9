use std::mem;

use tracing::trace;

use super::write::WriteOp;
use crate::storage::btree::page::Node;
use crate::storage::btree::Layout;
use crate::types::{PageId, Result, TreeError};

/// A modified subtree root after a removal.
enum Updated<L: Layout> {
    /// Written back; the subtree now lives at this page.
    Stored(PageId),
    /// Below minimum fill and not yet written; the parent rebalances it.
    Underfull(Node<L>),
}

enum Removal<L: Layout> {
    NotFound,
    Removed { child: Updated<L>, value: L::Value },
}

impl<L: Layout> WriteOp<'_, L> {
    pub(crate) fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let root = self.writer.root;
        let (child, value) = match self.remove_at(root, key)? {
            Removal::NotFound => return Ok(None),
            Removal::Removed { child, value } => (child, value),
        };
        let new_root = match child {
            Updated::Stored(id) => id,
            Updated::Underfull(node) if !node.is_leaf() && node.keys.is_empty() => {
                let only = node.children[0];
                self.release(node.id, node.generation);
                self.tree.stats.inc_root_collapses();
                trace!(old = node.id.0, new = only.0, "gentree.tree.root_collapse");
                only
            }
            // The root may hold fewer than the minimum.
            Updated::Underfull(node) => self.persist(node)?,
        };
        self.writer.root = new_root;
        Ok(Some(value))
    }

    fn remove_at(&mut self, id: PageId, key: &L::Key) -> Result<Removal<L>> {
        let mut node = self.load(id)?;
        if node.is_leaf() {
            let Ok(pos) = node.search(&self.tree.layout, key) else {
                return Ok(Removal::NotFound);
            };
            node.keys.remove(pos);
            let value = node.values.remove(pos);
            let child = self.settle(node)?;
            return Ok(Removal::Removed { child, value });
        }

        let idx = node.child_index(&self.tree.layout, key);
        match self.remove_at(node.children[idx], key)? {
            Removal::NotFound => Ok(Removal::NotFound),
            Removal::Removed {
                child: Updated::Stored(child),
                value,
            } => Ok(Removal::Removed {
                child: Updated::Stored(self.repoint(node, idx, child)?),
                value,
            }),
            Removal::Removed {
                child: Updated::Underfull(child),
                value,
            } => {
                self.rebalance(&mut node, idx, child)?;
                let child = self.settle(node)?;
                Ok(Removal::Removed { child, value })
            }
        }
    }

    fn settle(&mut self, node: Node<L>) -> Result<Updated<L>> {
        if node.keys.len() < self.min_len(&node) {
            return Ok(Updated::Underfull(node));
        }
        Ok(Updated::Stored(self.persist(node)?))
    }

    /// Restores minimum fill of child `idx`, borrowing from a sibling that can
    /// spare an entry, otherwise merging with one. Left siblings are preferred.
    fn rebalance(&mut self, parent: &mut Node<L>, idx: usize, child: Node<L>) -> Result<()> {
        let left = match idx.checked_sub(1) {
            Some(left_idx) => Some(self.load(parent.children[left_idx])?),
            None => None,
        };
        if let Some(left) = left {
            if left.keys.len() > self.min_len(&left) {
                return self.borrow_from_left(parent, idx, left, child);
            }
            if idx + 1 == parent.children.len() {
                return self.merge(parent, idx - 1, left, child);
            }
            let right = self.load(parent.children[idx + 1])?;
            if right.keys.len() > self.min_len(&right) {
                return self.borrow_from_right(parent, idx, child, right);
            }
            return self.merge(parent, idx - 1, left, child);
        }
        let right_id = *parent
            .children
            .get(idx + 1)
            .ok_or(TreeError::Corruption("internal node with a single child"))?;
        let right = self.load(right_id)?;
        if right.keys.len() > self.min_len(&right) {
            return self.borrow_from_right(parent, idx, child, right);
        }
        self.merge(parent, idx, child, right)
    }

    fn borrow_from_left(
        &mut self,
        parent: &mut Node<L>,
        idx: usize,
        mut left: Node<L>,
        mut child: Node<L>,
    ) -> Result<()> {
        let spare = left
            .keys
            .pop()
            .ok_or(TreeError::Corruption("borrow from empty sibling"))?;
        if child.is_leaf() {
            let value = left
                .values
                .pop()
                .ok_or(TreeError::Corruption("leaf keys and values out of step"))?;
            parent.keys[idx - 1] = spare.clone();
            child.keys.insert(0, spare);
            child.values.insert(0, value);
        } else {
            let moved = left
                .children
                .pop()
                .ok_or(TreeError::Corruption("borrow from childless sibling"))?;
            let sep = mem::replace(&mut parent.keys[idx - 1], spare);
            child.keys.insert(0, sep);
            child.children.insert(0, moved);
        }
        parent.children[idx - 1] = self.persist(left)?;
        parent.children[idx] = self.persist(child)?;
        self.tree.stats.inc_borrows();
        Ok(())
    }

    fn borrow_from_right(
        &mut self,
        parent: &mut Node<L>,
        idx: usize,
        mut child: Node<L>,
        mut right: Node<L>,
    ) -> Result<()> {
        if right.keys.len() < 2 {
            return Err(TreeError::Corruption("borrow from sibling at minimum fill"));
        }
        let spare = right.keys.remove(0);
        if child.is_leaf() {
            child.keys.push(spare);
            child.values.push(right.values.remove(0));
            parent.keys[idx] = right.keys[0].clone();
        } else {
            let sep = mem::replace(&mut parent.keys[idx], spare);
            child.keys.push(sep);
            child.children.push(right.children.remove(0));
        }
        parent.children[idx] = self.persist(child)?;
        parent.children[idx + 1] = self.persist(right)?;
        self.tree.stats.inc_borrows();
        Ok(())
    }

    /// Folds child `at + 1` of `parent` into child `at`.
    fn merge(&mut self, parent: &mut Node<L>, at: usize, mut left: Node<L>, right: Node<L>) -> Result<()> {
        let (right_id, right_generation) = (right.id, right.generation);
        let sep = parent.keys.remove(at);
        if !left.is_leaf() {
            left.keys.push(sep);
            left.children.extend(right.children);
        } else {
            left.values.extend(right.values);
        }
        left.keys.extend(right.keys);
        parent.children.remove(at + 1);
        self.release(right_id, right_generation);
        parent.children[at] = self.persist(left)?;
        self.tree.stats.inc_merges();
        Ok(())
    }
}
