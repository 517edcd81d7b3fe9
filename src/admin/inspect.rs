use std::path::Path;

use serde::Serialize;

use crate::admin::util::open_store;
use crate::admin::Result;
use crate::storage::btree::header::{HeaderStore, Meta, TreeState, STATE_PAGES};

/// Decoded meta page.
#[derive(Clone, Debug, Serialize)]
pub struct MetaSection {
    /// Bytes per page.
    pub page_size: u32,
    /// Per-file checksum salt.
    pub salt: u64,
    /// Layout identifier as stored.
    pub layout_id: u64,
    /// Layout identifier rendered as text when it is a printable tag.
    pub layout_tag: Option<String>,
    /// Layout major version.
    pub layout_major: u32,
    /// Layout minor version.
    pub layout_minor: u32,
    /// Node and state format version.
    pub tree_format: u16,
    /// Whether the layout encodes fixed-size entries.
    pub fixed_size: bool,
    /// Entries per leaf.
    pub leaf_capacity: usize,
    /// Keys per internal node.
    pub internal_capacity: usize,
}

/// One tree-state slot.
#[derive(Clone, Debug, Serialize)]
pub struct StateSection {
    /// Page holding the record.
    pub page: u64,
    /// False when the record failed validation.
    pub valid: bool,
    /// True for the record an open would use.
    pub current: bool,
    /// Write counter.
    pub counter: Option<u64>,
    /// Stable generation.
    pub stable_generation: Option<u64>,
    /// Unstable generation.
    pub unstable_generation: Option<u64>,
    /// Root page.
    pub root: Option<u64>,
    /// Generation of the root page.
    pub root_generation: Option<u64>,
    /// Next never-used page.
    pub next_page: Option<u64>,
    /// First free-list page, 0 when empty.
    pub free_list_head: Option<u64>,
    /// Whether the writing session closed cleanly.
    pub clean: Option<bool>,
    /// Header payload size in bytes.
    pub payload_len: Option<usize>,
    /// Header payload when it is valid UTF-8.
    pub payload_text: Option<String>,
}

/// Everything `gentree-inspect info` prints.
#[derive(Clone, Debug, Serialize)]
pub struct StoreInfo {
    /// Pages in the file.
    pub page_count: u64,
    /// Meta page contents.
    pub meta: MetaSection,
    /// Both state slots.
    pub states: Vec<StateSection>,
}

/// Reads the meta page and both state records of the store at `path`.
pub fn inspect_file(path: impl AsRef<Path>) -> Result<StoreInfo> {
    let store = open_store(path.as_ref())?;
    let meta = Meta::read(store.as_ref())?;
    let slots = HeaderStore::read_slots(store.as_ref())?;
    let newest = slots
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| slot.as_ref().map(|state| (idx, state.counter)))
        .max_by_key(|(_, counter)| *counter)
        .map(|(idx, _)| idx);
    let states = slots
        .iter()
        .enumerate()
        .map(|(idx, slot)| state_section(STATE_PAGES[idx].0, slot.as_ref(), newest == Some(idx)))
        .collect();
    Ok(StoreInfo {
        page_count: store.page_count(),
        meta: meta_section(&meta),
        states,
    })
}

fn meta_section(meta: &Meta) -> MetaSection {
    let tag = meta.layout_id.to_be_bytes();
    let trimmed: Vec<u8> = tag.iter().copied().take_while(|&b| b != 0).collect();
    let layout_tag = (!trimmed.is_empty()
        && trimmed.iter().all(|b| b.is_ascii_graphic()))
    .then(|| String::from_utf8_lossy(&trimmed).into_owned());
    MetaSection {
        page_size: meta.page_size,
        salt: meta.salt,
        layout_id: meta.layout_id,
        layout_tag,
        layout_major: meta.layout_major,
        layout_minor: meta.layout_minor,
        tree_format: meta.tree_format,
        fixed_size: meta.fixed_size,
        leaf_capacity: meta.capacity.leaf,
        internal_capacity: meta.capacity.internal,
    }
}

fn state_section(page: u64, state: Option<&TreeState>, current: bool) -> StateSection {
    StateSection {
        page,
        valid: state.is_some(),
        current,
        counter: state.map(|s| s.counter),
        stable_generation: state.map(|s| s.generations.stable),
        unstable_generation: state.map(|s| s.generations.unstable),
        root: state.map(|s| s.root.0),
        root_generation: state.map(|s| s.root_generation),
        next_page: state.map(|s| s.next_page),
        free_list_head: state.map(|s| s.free_list_head.0),
        clean: state.map(|s| s.clean),
        payload_len: state.map(|s| s.payload.len()),
        payload_text: state.and_then(|s| String::from_utf8(s.payload.clone()).ok()),
    }
}
