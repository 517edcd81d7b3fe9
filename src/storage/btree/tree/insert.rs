use tracing::trace;

use super::write::WriteOp;
use crate::storage::btree::page::Node;
use crate::storage::btree::Layout;
use crate::types::{PageId, Result, TreeError};

enum Inserted<K> {
    /// The subtree now lives at `id`.
    Done(PageId),
    /// The subtree split; `sep` is the smallest key reachable through `right`.
    Split { left: PageId, sep: K, right: PageId },
}

impl<L: Layout> WriteOp<'_, L> {
    pub(crate) fn insert(&mut self, key: L::Key, value: L::Value) -> Result<()> {
        let root = self.writer.root;
        let new_root = match self.insert_at(root, key, value)? {
            Inserted::Done(id) => id,
            Inserted::Split { left, sep, right } => {
                let mut node = self.new_internal();
                node.keys.push(sep);
                node.children.extend([left, right]);
                self.tree.stats.inc_root_splits();
                trace!(root = node.id.0, "gentree.tree.root_split");
                self.persist(node)?
            }
        };
        self.writer.root = new_root;
        Ok(())
    }

    fn insert_at(&mut self, id: PageId, key: L::Key, value: L::Value) -> Result<Inserted<L::Key>> {
        let mut node = self.load(id)?;
        if node.is_leaf() {
            match node.search(&self.tree.layout, &key) {
                Ok(pos) => node.values[pos] = value,
                Err(pos) => {
                    node.keys.insert(pos, key);
                    node.values.insert(pos, value);
                }
            }
            if node.keys.len() <= self.tree.capacity.leaf {
                return Ok(Inserted::Done(self.persist(node)?));
            }
            return self.split_leaf(node);
        }

        let idx = node.child_index(&self.tree.layout, &key);
        match self.insert_at(node.children[idx], key, value)? {
            Inserted::Done(child) => Ok(Inserted::Done(self.repoint(node, idx, child)?)),
            Inserted::Split { left, sep, right } => {
                node.children[idx] = left;
                node.keys.insert(idx, sep);
                node.children.insert(idx + 1, right);
                if node.keys.len() <= self.tree.capacity.internal {
                    return Ok(Inserted::Done(self.persist(node)?));
                }
                self.split_internal(node)
            }
        }
    }

    fn split_leaf(&mut self, mut node: Node<L>) -> Result<Inserted<L::Key>> {
        let mid = node.keys.len() / 2;
        let mut right = self.new_leaf();
        right.keys = node.keys.split_off(mid);
        right.values = node.values.split_off(mid);
        let sep = right.keys[0].clone();
        let left = self.persist(node)?;
        let right = self.persist(right)?;
        self.tree.stats.inc_leaf_splits();
        Ok(Inserted::Split { left, sep, right })
    }

    /// Moves the upper half of an overfull internal node to a new sibling and
    /// pushes the middle key up.
    fn split_internal(&mut self, mut node: Node<L>) -> Result<Inserted<L::Key>> {
        let mid = node.keys.len() / 2;
        let mut right = self.new_internal();
        right.keys = node.keys.split_off(mid + 1);
        right.children = node.children.split_off(mid + 1);
        let sep = node
            .keys
            .pop()
            .ok_or(TreeError::Corruption("internal split without separator"))?;
        let left = self.persist(node)?;
        let right = self.persist(right)?;
        self.tree.stats.inc_internal_splits();
        Ok(Inserted::Split { left, sep, right })
    }
}
