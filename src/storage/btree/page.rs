//! On-page node format.
//!
//! Every node page starts with the common page header, followed by a node header:
//!
//! ```text
//! 32..34  key count (u16)
//! 34..40  reserved
//! 40..48  generation the page was written at
//! 48..56  write sequence of the operation that last rewrote the page
//! ```
//!
//! Leaves store `(key, value)` entries back to back from offset 56. Internal
//! nodes store `key_count + 1` generation-safe pointers at fixed offsets from 56,
//! then their separator keys. Variable-size layouts prefix each key and value
//! with a `u16` length. Fixed pointer offsets let recovery repair pointers without
//! knowing the key layout.

use std::cmp::Ordering;
use std::convert::TryFrom;

use super::gsp::{Generations, Gsp, GSP_LEN};
use super::Layout;
use crate::primitives::bytes::{get_u16, get_u64, put_u16, put_u64};
use crate::types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, TreeError};

const KEY_COUNT: usize = PAGE_HDR_LEN;
const GENERATION: usize = PAGE_HDR_LEN + 8;
const SEQ: usize = PAGE_HDR_LEN + 16;

/// First byte after the node header.
pub const NODE_HDR_END: usize = PAGE_HDR_LEN + 24;

const LEN_PREFIX: usize = 2;

/// Leaf or internal node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Holds entries.
    Leaf,
    /// Holds separators and child pointers.
    Internal,
}

impl NodeKind {
    fn page_kind(self) -> PageKind {
        match self {
            NodeKind::Leaf => PageKind::TreeLeaf,
            NodeKind::Internal => PageKind::TreeInternal,
        }
    }
}

impl TryFrom<PageKind> for NodeKind {
    type Error = TreeError;

    fn try_from(kind: PageKind) -> Result<Self> {
        match kind {
            PageKind::TreeLeaf => Ok(NodeKind::Leaf),
            PageKind::TreeInternal => Ok(NodeKind::Internal),
            _ => Err(TreeError::Corruption("page is not a tree node")),
        }
    }
}

/// Layout-independent view of a node header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeHeader {
    /// Node kind from the page header.
    pub kind: NodeKind,
    /// Number of keys in the node.
    pub key_count: usize,
    /// Generation the page was written at.
    pub generation: u64,
    /// Write sequence that last rewrote the page.
    pub seq: u64,
}

impl NodeHeader {
    /// Parses the page and node headers.
    pub fn parse(page: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(page)?;
        let kind = NodeKind::try_from(header.kind)?;
        let key_count = get_u16(page, KEY_COUNT)? as usize;
        if kind == NodeKind::Internal && gsp_offset(key_count + 1) > page.len() {
            return Err(TreeError::Corruption("internal node pointer array exceeds page"));
        }
        Ok(Self {
            kind,
            key_count,
            generation: get_u64(page, GENERATION)?,
            seq: get_u64(page, SEQ)?,
        })
    }
}

/// Byte offset of child pointer `idx` inside an internal node page.
pub fn gsp_offset(idx: usize) -> usize {
    NODE_HDR_END + idx * GSP_LEN
}

/// Reads child pointer `idx` of an internal node page.
pub fn read_gsp(page: &[u8], idx: usize) -> Result<Gsp> {
    let off = gsp_offset(idx);
    page.get(off..off + GSP_LEN)
        .ok_or(TreeError::Corruption("child pointer outside page"))
        .and_then(Gsp::decode)
}

/// Overwrites child pointer `idx` of an internal node page.
pub fn write_gsp(page: &mut [u8], idx: usize, gsp: &Gsp) -> Result<()> {
    let off = gsp_offset(idx);
    let dst = page
        .get_mut(off..off + GSP_LEN)
        .ok_or(TreeError::Corruption("child pointer outside page"))?;
    gsp.encode(dst);
    Ok(())
}

/// Maximum entries per leaf and keys per internal node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capacity {
    /// Entries per leaf.
    pub leaf: usize,
    /// Separator keys per internal node.
    pub internal: usize,
}

impl Capacity {
    /// Smallest capacity the split and merge arithmetic supports.
    pub const MIN: usize = 3;

    /// Derives capacities from the page size and the layout's maximum sizes,
    /// optionally clamped to `limit`.
    pub fn for_layout<L: Layout>(layout: &L, page_size: u32, limit: Option<usize>) -> Result<Self> {
        let avail = (page_size as usize).saturating_sub(NODE_HDR_END);
        let prefix = if layout.fixed_size() { 0 } else { LEN_PREFIX };
        let entry = layout.max_key_size() + layout.max_value_size() + 2 * prefix;
        let leaf = avail / entry.max(1);
        let internal = avail.saturating_sub(GSP_LEN) / (GSP_LEN + layout.max_key_size() + prefix);
        let clamp = |cap: usize| limit.map_or(cap, |limit| cap.min(limit));
        let capacity = Self {
            leaf: clamp(leaf).min(u16::MAX as usize),
            internal: clamp(internal).min(u16::MAX as usize - 1),
        };
        capacity.validate()?;
        Ok(capacity)
    }

    /// Rejects capacities too small for balanced splits and merges.
    pub fn validate(&self) -> Result<()> {
        if self.leaf < Self::MIN || self.internal < Self::MIN {
            return Err(TreeError::Invalid(
                "page too small for layout: nodes need room for at least three keys",
            ));
        }
        Ok(())
    }

    /// Fewest entries a non-root leaf may hold.
    pub fn min_leaf(&self) -> usize {
        self.leaf / 2
    }

    /// Fewest keys a non-root internal node may hold.
    pub fn min_internal(&self) -> usize {
        self.internal / 2
    }
}

/// Decoded tree node.
#[derive(Debug)]
pub struct Node<L: Layout> {
    /// Page holding the node.
    pub id: PageId,
    /// Leaf or internal.
    pub kind: NodeKind,
    /// Generation the page was written at.
    pub generation: u64,
    /// Write sequence that last rewrote the page.
    pub seq: u64,
    /// Keys in layout order.
    pub keys: Vec<L::Key>,
    /// Leaf values, parallel to `keys`.
    pub values: Vec<L::Value>,
    /// Internal children, one more than `keys`, resolved to page ids.
    pub children: Vec<PageId>,
}

impl<L: Layout> Node<L> {
    /// Empty leaf.
    pub fn new_leaf(id: PageId, generation: u64, seq: u64) -> Self {
        Self::empty(id, NodeKind::Leaf, generation, seq)
    }

    /// Internal node with no children yet.
    pub fn new_internal(id: PageId, generation: u64, seq: u64) -> Self {
        Self::empty(id, NodeKind::Internal, generation, seq)
    }

    fn empty(id: PageId, kind: NodeKind, generation: u64, seq: u64) -> Self {
        Self {
            id,
            kind,
            generation,
            seq,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    /// Binary search for `key` among the node's keys.
    pub fn search(&self, layout: &L, key: &L::Key) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|probe| layout.compare(probe, key))
    }

    /// Index of the child whose range holds `key`.
    ///
    /// Separator `i` is the smallest key reachable through child `i + 1`.
    pub fn child_index(&self, layout: &L, key: &L::Key) -> usize {
        self.keys
            .partition_point(|probe| layout.compare(probe, key) != Ordering::Greater)
    }

    /// Decodes a node page, resolving child pointers under `gens`.
    pub fn decode(id: PageId, page: &[u8], layout: &L, gens: Generations) -> Result<Self> {
        let header = NodeHeader::parse(page)?;
        let mut node = Self::empty(id, header.kind, header.generation, header.seq);
        let fixed = layout.fixed_size();
        match header.kind {
            NodeKind::Leaf => {
                let mut off = NODE_HDR_END;
                node.keys.reserve(header.key_count);
                node.values.reserve(header.key_count);
                for _ in 0..header.key_count {
                    let (key, next) = read_field(page, off, fixed, layout.max_key_size())?;
                    node.keys.push(layout.read_key(key)?);
                    let (value, next) = read_field(page, next, fixed, layout.max_value_size())?;
                    node.values.push(layout.read_value(value)?);
                    off = next;
                }
            }
            NodeKind::Internal => {
                if header.key_count == 0 {
                    return Err(TreeError::Corruption("internal node without separators"));
                }
                node.children.reserve(header.key_count + 1);
                for idx in 0..=header.key_count {
                    node.children.push(read_gsp(page, idx)?.resolve(gens)?);
                }
                let mut off = gsp_offset(header.key_count + 1);
                node.keys.reserve(header.key_count);
                for _ in 0..header.key_count {
                    let (key, next) = read_field(page, off, fixed, layout.max_key_size())?;
                    node.keys.push(layout.read_key(key)?);
                    off = next;
                }
            }
        }
        Ok(node)
    }

    /// Rewrites `page` with this node. Child pointers are written as single-slot
    /// pointers at the node's own generation.
    pub fn encode(&self, page: &mut [u8], layout: &L, salt: u64) -> Result<()> {
        let page_size =
            u32::try_from(page.len()).map_err(|_| TreeError::Invalid("page too large"))?;
        if self.keys.len() > u16::MAX as usize {
            return Err(TreeError::Invalid("node key count exceeds u16"));
        }
        page.fill(0);
        PageHeader::new(self.id, self.kind.page_kind(), page_size, salt)?.encode(page)?;
        put_u16(page, KEY_COUNT, self.keys.len() as u16);
        put_u64(page, GENERATION, self.generation);
        put_u64(page, SEQ, self.seq);
        let fixed = layout.fixed_size();
        match self.kind {
            NodeKind::Leaf => {
                if self.values.len() != self.keys.len() {
                    return Err(TreeError::Invalid("leaf keys and values out of step"));
                }
                let mut off = NODE_HDR_END;
                for (key, value) in self.keys.iter().zip(&self.values) {
                    off = write_field(page, off, fixed, layout.key_size(key), |dst| {
                        layout.write_key(key, dst)
                    })?;
                    off = write_field(page, off, fixed, layout.value_size(value), |dst| {
                        layout.write_value(value, dst)
                    })?;
                }
            }
            NodeKind::Internal => {
                if self.children.len() != self.keys.len() + 1 || self.keys.is_empty() {
                    return Err(TreeError::Invalid("internal node shape is inconsistent"));
                }
                for (idx, child) in self.children.iter().enumerate() {
                    write_gsp(page, idx, &Gsp::single(*child, self.generation))
                        .map_err(|_| TreeError::Invalid("node does not fit in page"))?;
                }
                let mut off = gsp_offset(self.children.len());
                for key in &self.keys {
                    off = write_field(page, off, fixed, layout.key_size(key), |dst| {
                        layout.write_key(key, dst)
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn read_field(page: &[u8], off: usize, fixed: bool, max: usize) -> Result<(&[u8], usize)> {
    let (len, start) = if fixed {
        (max, off)
    } else {
        let len = get_u16(page, off)? as usize;
        if len > max {
            return Err(TreeError::Corruption("encoded field longer than layout maximum"));
        }
        (len, off + LEN_PREFIX)
    };
    let end = start + len;
    let bytes = page
        .get(start..end)
        .ok_or(TreeError::Corruption("node entry extends past page"))?;
    Ok((bytes, end))
}

fn write_field(
    page: &mut [u8],
    off: usize,
    fixed: bool,
    len: usize,
    encode: impl FnOnce(&mut [u8]),
) -> Result<usize> {
    let start = if fixed {
        off
    } else {
        let prefix = u16::try_from(len).map_err(|_| TreeError::Invalid("field longer than u16"))?;
        if off + LEN_PREFIX > page.len() {
            return Err(TreeError::Invalid("node does not fit in page"));
        }
        put_u16(page, off, prefix);
        off + LEN_PREFIX
    };
    let dst = page
        .get_mut(start..start + len)
        .ok_or(TreeError::Invalid("node does not fit in page"))?;
    encode(dst);
    Ok(start + len)
}
