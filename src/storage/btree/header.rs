//! Engine-owned header region: the meta page and the alternating state pages.
//!
//! Page 0 records the store format and the identity of the layout that wrote it.
//! Pages 1 and 2 hold tree-state records written alternately; each carries a
//! monotonically increasing counter and its own checksum, so a torn write of one
//! record leaves the other usable.

use std::sync::Arc;

use tracing::warn;

use super::gsp::Generations;
use super::page::Capacity;
use super::Layout;
use crate::primitives::bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::primitives::pager::{PageIntent, PageStore};
use crate::types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, TreeError};

/// Page holding [`Meta`].
pub const META_PAGE: PageId = PageId(0);
/// Pages holding the alternating [`TreeState`] records.
pub const STATE_PAGES: [PageId; 2] = [PageId(1), PageId(2)];
/// First page available to the tree and free list.
pub const FIRST_DATA_PAGE: u64 = 3;

/// Version of the node and state formats.
pub const TREE_FORMAT_VERSION: u16 = 1;

mod meta_off {
    use super::PAGE_HDR_LEN;

    pub const LAYOUT_ID: usize = PAGE_HDR_LEN;
    pub const LAYOUT_MAJOR: usize = PAGE_HDR_LEN + 8;
    pub const LAYOUT_MINOR: usize = PAGE_HDR_LEN + 12;
    pub const TREE_FORMAT: usize = PAGE_HDR_LEN + 16;
    pub const FIXED_SIZE: usize = PAGE_HDR_LEN + 18;
    pub const LEAF_CAPACITY: usize = PAGE_HDR_LEN + 20;
    pub const INTERNAL_CAPACITY: usize = PAGE_HDR_LEN + 24;
}

mod state_off {
    use super::PAGE_HDR_LEN;

    pub const COUNTER: usize = PAGE_HDR_LEN;
    pub const STABLE: usize = PAGE_HDR_LEN + 8;
    pub const UNSTABLE: usize = PAGE_HDR_LEN + 16;
    pub const ROOT: usize = PAGE_HDR_LEN + 24;
    pub const ROOT_GENERATION: usize = PAGE_HDR_LEN + 32;
    pub const NEXT_PAGE: usize = PAGE_HDR_LEN + 40;
    pub const FREE_LIST_HEAD: usize = PAGE_HDR_LEN + 48;
    pub const CLEAN: usize = PAGE_HDR_LEN + 56;
    pub const PAYLOAD_LEN: usize = PAGE_HDR_LEN + 60;
    pub const CHECKSUM: usize = PAGE_HDR_LEN + 64;
    pub const PAYLOAD: usize = PAGE_HDR_LEN + 68;
}

/// Store identity recorded on page 0.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Meta {
    /// Page size of the store.
    pub page_size: u32,
    /// Salt mixed into page checksums.
    pub salt: u64,
    /// [`Layout::identifier`] of the writer.
    pub layout_id: u64,
    /// [`Layout::major_version`] of the writer.
    pub layout_major: u32,
    /// [`Layout::minor_version`] of the writer.
    pub layout_minor: u32,
    /// Node and state format version.
    pub tree_format: u16,
    /// Whether the layout was fixed-size.
    pub fixed_size: bool,
    /// Node capacities fixed at creation.
    pub capacity: Capacity,
}

impl Meta {
    /// Meta for a new store written with `layout`.
    pub fn for_layout<L: Layout>(layout: &L, page_size: u32, salt: u64, capacity: Capacity) -> Self {
        Self {
            page_size,
            salt,
            layout_id: layout.identifier(),
            layout_major: layout.major_version(),
            layout_minor: layout.minor_version(),
            tree_format: TREE_FORMAT_VERSION,
            fixed_size: layout.fixed_size(),
            capacity,
        }
    }

    /// Fails with [`TreeError::MetadataMismatch`] unless `layout` wrote this store.
    pub fn check_layout<L: Layout>(&self, layout: &L) -> Result<()> {
        if self.tree_format != TREE_FORMAT_VERSION {
            return Err(TreeError::MetadataMismatch("unsupported tree format version"));
        }
        if self.layout_id != layout.identifier() {
            return Err(TreeError::MetadataMismatch("layout identifier differs"));
        }
        if self.layout_major != layout.major_version()
            || self.layout_minor != layout.minor_version()
        {
            return Err(TreeError::MetadataMismatch("layout version differs"));
        }
        if self.fixed_size != layout.fixed_size() {
            return Err(TreeError::MetadataMismatch("layout size class differs"));
        }
        Ok(())
    }

    /// Writes the meta page image.
    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        page.fill(0);
        PageHeader::new(META_PAGE, PageKind::Meta, self.page_size, self.salt)?.encode(page)?;
        put_u64(page, meta_off::LAYOUT_ID, self.layout_id);
        put_u32(page, meta_off::LAYOUT_MAJOR, self.layout_major);
        put_u32(page, meta_off::LAYOUT_MINOR, self.layout_minor);
        put_u16(page, meta_off::TREE_FORMAT, self.tree_format);
        page[meta_off::FIXED_SIZE] = u8::from(self.fixed_size);
        put_u32(page, meta_off::LEAF_CAPACITY, self.capacity.leaf as u32);
        put_u32(page, meta_off::INTERNAL_CAPACITY, self.capacity.internal as u32);
        Ok(())
    }

    /// Parses a meta page image.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(page)?;
        if header.kind != PageKind::Meta {
            return Err(TreeError::Corruption("page 0 is not a meta page"));
        }
        let capacity = Capacity {
            leaf: get_u32(page, meta_off::LEAF_CAPACITY)? as usize,
            internal: get_u32(page, meta_off::INTERNAL_CAPACITY)? as usize,
        };
        capacity
            .validate()
            .map_err(|_| TreeError::Corruption("meta page node capacity out of range"))?;
        Ok(Self {
            page_size: header.page_size,
            salt: header.salt,
            layout_id: get_u64(page, meta_off::LAYOUT_ID)?,
            layout_major: get_u32(page, meta_off::LAYOUT_MAJOR)?,
            layout_minor: get_u32(page, meta_off::LAYOUT_MINOR)?,
            tree_format: get_u16(page, meta_off::TREE_FORMAT)?,
            fixed_size: page[meta_off::FIXED_SIZE] != 0,
            capacity,
        })
    }

    /// Reads and parses page 0.
    pub fn read(store: &dyn PageStore) -> Result<Self> {
        let cursor = store.acquire_cursor(META_PAGE, PageIntent::Read)?;
        let meta = Self::decode(cursor.data())?;
        if meta.page_size != store.page_size() {
            return Err(TreeError::MetadataMismatch("page size differs from store"));
        }
        Ok(meta)
    }

    /// Writes page 0 through `store`.
    pub fn write(&self, store: &dyn PageStore) -> Result<()> {
        let mut cursor = store.acquire_cursor(META_PAGE, PageIntent::Write)?;
        self.encode(cursor.data_mut()?)
    }
}

/// One tree-state record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeState {
    /// Incremented on every state write; the highest valid record wins.
    pub counter: u64,
    /// Generation pair at the time of writing.
    pub generations: Generations,
    /// Root node page.
    pub root: PageId,
    /// Generation of the root page.
    pub root_generation: u64,
    /// Next never-used page id.
    pub next_page: u64,
    /// First page of the persisted free list, or page 0 when empty.
    pub free_list_head: PageId,
    /// True when the session that wrote the record closed cleanly.
    pub clean: bool,
    /// Caller-owned header payload.
    pub payload: Vec<u8>,
}

impl TreeState {
    /// Largest payload that fits in a state page of `page_size` bytes.
    pub fn max_payload(page_size: u32) -> usize {
        (page_size as usize).saturating_sub(state_off::PAYLOAD)
    }

    fn checksum(page: &[u8], payload_len: usize) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page[state_off::COUNTER..state_off::CHECKSUM]);
        hasher.update(&page[state_off::PAYLOAD..state_off::PAYLOAD + payload_len]);
        hasher.finalize()
    }

    /// Writes the record into a state page image.
    pub fn encode(&self, page: &mut [u8], id: PageId, salt: u64) -> Result<()> {
        let page_size = page.len() as u32;
        if self.payload.len() > Self::max_payload(page_size) {
            return Err(TreeError::Invalid("header payload does not fit in a state page"));
        }
        page.fill(0);
        PageHeader::new(id, PageKind::State, page_size, salt)?.encode(page)?;
        put_u64(page, state_off::COUNTER, self.counter);
        put_u64(page, state_off::STABLE, self.generations.stable);
        put_u64(page, state_off::UNSTABLE, self.generations.unstable);
        put_u64(page, state_off::ROOT, self.root.0);
        put_u64(page, state_off::ROOT_GENERATION, self.root_generation);
        put_u64(page, state_off::NEXT_PAGE, self.next_page);
        put_u64(page, state_off::FREE_LIST_HEAD, self.free_list_head.0);
        page[state_off::CLEAN] = u8::from(self.clean);
        put_u32(page, state_off::PAYLOAD_LEN, self.payload.len() as u32);
        page[state_off::PAYLOAD..state_off::PAYLOAD + self.payload.len()]
            .copy_from_slice(&self.payload);
        let crc = Self::checksum(page, self.payload.len());
        put_u32(page, state_off::CHECKSUM, crc);
        Ok(())
    }

    /// Parses and validates a state page image.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(page)?;
        if header.kind != PageKind::State {
            return Err(TreeError::Corruption("page is not a state page"));
        }
        let payload_len = get_u32(page, state_off::PAYLOAD_LEN)? as usize;
        if payload_len > Self::max_payload(page.len() as u32) {
            return Err(TreeError::Corruption("state payload length out of range"));
        }
        if Self::checksum(page, payload_len) != get_u32(page, state_off::CHECKSUM)? {
            return Err(TreeError::Corruption("state record checksum mismatch"));
        }
        let generations = Generations {
            stable: get_u64(page, state_off::STABLE)?,
            unstable: get_u64(page, state_off::UNSTABLE)?,
        };
        if generations.stable == 0 || generations.unstable <= generations.stable {
            return Err(TreeError::Corruption("state record generations out of order"));
        }
        let next_page = get_u64(page, state_off::NEXT_PAGE)?;
        let root = PageId(get_u64(page, state_off::ROOT)?);
        if root.0 < FIRST_DATA_PAGE || root.0 >= next_page {
            return Err(TreeError::Corruption("state record root out of range"));
        }
        Ok(Self {
            counter: get_u64(page, state_off::COUNTER)?,
            generations,
            root,
            root_generation: get_u64(page, state_off::ROOT_GENERATION)?,
            next_page,
            free_list_head: PageId(get_u64(page, state_off::FREE_LIST_HEAD)?),
            clean: page[state_off::CLEAN] != 0,
            payload: page[state_off::PAYLOAD..state_off::PAYLOAD + payload_len].to_vec(),
        })
    }
}

/// Reads and writes the alternating state records.
pub struct HeaderStore {
    store: Arc<dyn PageStore>,
    last_slot: usize,
    counter: u64,
}

impl HeaderStore {
    /// Header store for a freshly created file; the first write lands in slot 0.
    pub fn create(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            last_slot: 1,
            counter: 0,
        }
    }

    /// Loads the newest valid state record.
    pub fn load(store: Arc<dyn PageStore>) -> Result<(Self, TreeState)> {
        let slots = Self::read_slots(store.as_ref())?;
        let (slot, state) = slots
            .into_iter()
            .enumerate()
            .filter_map(|(idx, state)| state.map(|state| (idx, state)))
            .max_by_key(|(_, state)| state.counter)
            .ok_or(TreeError::Corruption("no valid tree state record"))?;
        let header = Self {
            store,
            last_slot: slot,
            counter: state.counter,
        };
        Ok((header, state))
    }

    /// Reads both state slots; a slot that fails validation reads as `None`.
    pub fn read_slots(store: &dyn PageStore) -> Result<[Option<TreeState>; 2]> {
        let mut slots = [None, None];
        for (idx, id) in STATE_PAGES.iter().enumerate() {
            let decoded = store
                .acquire_cursor(*id, PageIntent::Read)
                .and_then(|cursor| TreeState::decode(cursor.data()));
            match decoded {
                Ok(state) => slots[idx] = Some(state),
                Err(err) if err.is_corruption() => {
                    warn!(page = id.0, error = %err, "gentree.header.state_slot_invalid");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(slots)
    }

    /// Writes `state` into the slot not written last, assigning the next counter.
    /// Durability requires a subsequent [`PageStore::flush`].
    pub fn write(&mut self, state: &mut TreeState) -> Result<()> {
        let slot = 1 - self.last_slot;
        state.counter = self.counter + 1;
        let id = STATE_PAGES[slot];
        {
            let mut cursor = self.store.acquire_cursor(id, PageIntent::Write)?;
            state.encode(cursor.data_mut()?, id, self.store.salt())?;
        }
        self.last_slot = slot;
        self.counter = state.counter;
        Ok(())
    }
}
