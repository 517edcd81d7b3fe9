//! Released pages awaiting reuse.
//!
//! A page is reusable once two conditions hold. The generation gate: a page
//! that belonged to the stable tree stays reachable after a crash until the next
//! checkpoint, so it carries `reuse_after = unstable` and becomes free only when
//! the stable generation catches up. The reader gate: a cursor registered at write
//! sequence `r` may still be walking the page if it was released by a later write,
//! so reuse waits until every such cursor is gone.

use std::collections::VecDeque;

use crate::primitives::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, TreeError};

const NEXT: usize = PAGE_HDR_LEN;
const COUNT: usize = PAGE_HDR_LEN + 8;
const ENTRIES: usize = PAGE_HDR_LEN + 16;
const ENTRY_LEN: usize = 16;

/// A released page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeEntry {
    /// Released page.
    pub id: PageId,
    /// Stable generation at or after which the page may be reused.
    pub reuse_after: u64,
    /// Write sequence that released the page.
    pub released_by: u64,
}

/// In-memory free list.
#[derive(Clone, Debug, Default)]
pub struct FreeList {
    entries: VecDeque<FreeEntry>,
}

impl FreeList {
    /// Rebuilds the list from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = FreeEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Number of released pages, reusable or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been released.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the entries in release order.
    pub fn iter(&self) -> impl Iterator<Item = &FreeEntry> {
        self.entries.iter()
    }

    /// Records a released page.
    pub fn release(&mut self, id: PageId, reuse_after: u64, released_by: u64) {
        self.entries.push_back(FreeEntry {
            id,
            reuse_after,
            released_by,
        });
    }

    /// Takes the oldest page that both gates allow.
    ///
    /// `oldest_reader` is the registration sequence of the oldest live cursor.
    pub fn take(&mut self, stable: u64, op_seq: u64, oldest_reader: Option<u64>) -> Option<PageId> {
        let pos = self.entries.iter().position(|entry| {
            entry.reuse_after <= stable
                && entry.released_by < op_seq
                && oldest_reader.map_or(true, |reader| entry.released_by <= reader)
        })?;
        self.entries.remove(pos).map(|entry| entry.id)
    }
}

/// Entries that fit in one free-list page.
pub fn free_page_capacity(page_size: usize) -> usize {
    page_size.saturating_sub(ENTRIES) / ENTRY_LEN
}

/// Decoded free-list chain page.
pub struct FreePage {
    /// Next page in the chain, or page 0.
    pub next: PageId,
    /// Entries stored on this page.
    pub entries: Vec<FreeEntry>,
}

/// Parses a free-list chain page.
pub fn read_free_page(buf: &[u8]) -> Result<FreePage> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::FreeList {
        return Err(TreeError::Corruption("free page kind mismatch"));
    }
    let count = get_u32(buf, COUNT)? as usize;
    if count > free_page_capacity(buf.len()) {
        return Err(TreeError::Corruption("free page count exceeds capacity"));
    }
    let mut entries = Vec::with_capacity(count);
    for idx in 0..count {
        let off = ENTRIES + idx * ENTRY_LEN;
        entries.push(FreeEntry {
            id: PageId(get_u64(buf, off)?),
            reuse_after: get_u64(buf, off + 8)?,
            released_by: 0,
        });
    }
    Ok(FreePage {
        next: PageId(get_u64(buf, NEXT)?),
        entries,
    })
}

/// Formats a free-list chain page.
pub fn write_free_page(
    buf: &mut [u8],
    page_id: PageId,
    salt: u64,
    next: PageId,
    entries: &[FreeEntry],
) -> Result<()> {
    if entries.len() > free_page_capacity(buf.len()) {
        return Err(TreeError::Invalid("too many entries for a free page"));
    }
    buf.fill(0);
    PageHeader::new(page_id, PageKind::FreeList, buf.len() as u32, salt)?.encode(buf)?;
    put_u64(buf, NEXT, next.0);
    put_u32(buf, COUNT, entries.len() as u32);
    for (idx, entry) in entries.iter().enumerate() {
        let off = ENTRIES + idx * ENTRY_LEN;
        put_u64(buf, off, entry.id.0);
        put_u64(buf, off + 8, entry.reuse_after);
    }
    Ok(())
}
