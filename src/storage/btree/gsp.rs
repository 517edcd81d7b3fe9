//! Generation-safe pointers.
//!
//! A child reference is stored as two slots, each holding a generation, a page
//! id and a checksum over both. Writers only ever touch the slot belonging to the
//! unstable generation (or a slot that is free to reuse), so the slot written at
//! the last checkpoint survives any crash. Readers pick the newest slot whose
//! generation is visible to them.

use crate::primitives::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::types::{slot_crc32, PageId, Result, TreeError};

/// Encoded size of one slot.
pub const GSP_SLOT_LEN: usize = 20;
/// Encoded size of a two-slot pointer.
pub const GSP_LEN: usize = 2 * GSP_SLOT_LEN;

/// The generation pair a reader or writer operates under.
///
/// `stable` is the generation published by the last checkpoint; `unstable` is the
/// generation new writes are stamped with. Generations strictly between the two
/// belong to sessions that crashed before checkpointing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Generations {
    /// Last checkpointed generation.
    pub stable: u64,
    /// Generation of in-flight writes.
    pub unstable: u64,
}

impl Generations {
    /// Generation pair after a checkpoint publishes the current unstable generation.
    pub fn advanced(self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }

    /// True when a page stamped with `generation` belongs to the stable tree.
    pub fn is_stable(self, generation: u64) -> bool {
        generation <= self.stable
    }
}

/// Classification of a slot relative to a [`Generations`] pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Never written, or zeroed by cleanup.
    Empty,
    /// Written at or before the last checkpoint.
    Stable,
    /// Written in the current session.
    Unstable,
    /// Written by a session that crashed before checkpointing.
    Crashed,
    /// Checksum failure or impossible generation; treated like a crash leftover.
    Broken,
}

impl SlotState {
    /// True for slots a reader may follow.
    pub fn is_valid(self) -> bool {
        matches!(self, SlotState::Stable | SlotState::Unstable)
    }

    /// True for slots the cleanup pass must zero.
    pub fn needs_cleanup(self) -> bool {
        matches!(self, SlotState::Crashed | SlotState::Broken)
    }
}

/// One half of a generation-safe pointer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GspSlot {
    /// Generation the slot was written at.
    pub generation: u64,
    /// Target page.
    pub pointer: u64,
    /// Checksum over generation and pointer.
    pub checksum: u32,
}

impl GspSlot {
    /// Builds a checksummed slot.
    pub fn new(generation: u64, pointer: PageId) -> Self {
        Self {
            generation,
            pointer: pointer.0,
            checksum: slot_crc32(generation, pointer.0),
        }
    }

    /// Classifies the slot.
    pub fn state(&self, gens: Generations) -> SlotState {
        if *self == GspSlot::default() {
            return SlotState::Empty;
        }
        if self.checksum != slot_crc32(self.generation, self.pointer) || self.generation == 0 {
            return SlotState::Broken;
        }
        if self.generation <= gens.stable {
            SlotState::Stable
        } else if self.generation == gens.unstable {
            SlotState::Unstable
        } else if self.generation < gens.unstable {
            SlotState::Crashed
        } else {
            SlotState::Broken
        }
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(Self {
            generation: get_u64(src, 0)?,
            pointer: get_u64(src, 8)?,
            checksum: get_u32(src, 16)?,
        })
    }

    fn encode(&self, dst: &mut [u8]) {
        put_u64(dst, 0, self.generation);
        put_u64(dst, 8, self.pointer);
        put_u32(dst, 16, self.checksum);
    }
}

/// Two-slot child reference.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Gsp {
    /// Both slots in on-disk order.
    pub slots: [GspSlot; 2],
}

impl Gsp {
    /// Pointer with only the first slot populated.
    pub fn single(pointer: PageId, generation: u64) -> Self {
        Self {
            slots: [GspSlot::new(generation, pointer), GspSlot::default()],
        }
    }

    /// Decodes the [`GSP_LEN`] bytes at the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < GSP_LEN {
            return Err(TreeError::Corruption("generation-safe pointer truncated"));
        }
        Ok(Self {
            slots: [
                GspSlot::decode(&src[..GSP_SLOT_LEN])?,
                GspSlot::decode(&src[GSP_SLOT_LEN..GSP_LEN])?,
            ],
        })
    }

    /// Encodes both slots into the start of `dst`.
    pub fn encode(&self, dst: &mut [u8]) {
        self.slots[0].encode(&mut dst[..GSP_SLOT_LEN]);
        self.slots[1].encode(&mut dst[GSP_SLOT_LEN..GSP_LEN]);
    }

    /// Page the pointer refers to under `gens`: the newest valid slot wins.
    pub fn resolve(&self, gens: Generations) -> Result<PageId> {
        self.slots
            .iter()
            .filter(|slot| slot.state(gens).is_valid())
            .max_by_key(|slot| slot.generation)
            .map(|slot| PageId(slot.pointer))
            .ok_or(TreeError::Corruption("no valid generation-safe pointer slot"))
    }

    /// Page the pointer referred to at the last checkpoint.
    pub fn resolve_stable(&self, gens: Generations) -> Result<PageId> {
        self.slots
            .iter()
            .filter(|slot| slot.state(gens) == SlotState::Stable)
            .max_by_key(|slot| slot.generation)
            .map(|slot| PageId(slot.pointer))
            .ok_or(TreeError::Corruption("no stable generation-safe pointer slot"))
    }

    /// Page the older valid slot refers to, when both slots are valid.
    pub fn resolve_previous(&self, gens: Generations) -> Option<PageId> {
        let [a, b] = self.slots;
        if !(a.state(gens).is_valid() && b.state(gens).is_valid()) {
            return None;
        }
        let older = if a.generation <= b.generation { a } else { b };
        Some(PageId(older.pointer))
    }

    /// True when a slot carries the unstable generation.
    pub fn has_unstable(&self, gens: Generations) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state(gens) == SlotState::Unstable)
    }

    /// Points the unstable generation at `pointer`, returning the slot index written.
    ///
    /// The slot already carrying the unstable generation is reused; otherwise an
    /// empty or crashed slot; otherwise the older of two stable slots. The newest
    /// stable slot is never overwritten.
    pub fn write(&mut self, pointer: PageId, gens: Generations) -> usize {
        let states = [self.slots[0].state(gens), self.slots[1].state(gens)];
        let idx = if let Some(idx) = states.iter().position(|s| *s == SlotState::Unstable) {
            idx
        } else if let Some(idx) = states.iter().position(|s| !s.is_valid()) {
            idx
        } else if self.slots[0].generation <= self.slots[1].generation {
            0
        } else {
            1
        };
        self.slots[idx] = GspSlot::new(gens.unstable, pointer);
        idx
    }

    /// Number of slots the cleanup pass would zero.
    pub fn crashed_slots(&self, gens: Generations) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state(gens).needs_cleanup())
            .count()
    }

    /// Zeroes crashed and broken slots, returning how many were cleared.
    pub fn clean(&mut self, gens: Generations) -> usize {
        let mut cleaned = 0;
        for slot in &mut self.slots {
            if slot.state(gens).needs_cleanup() {
                *slot = GspSlot::default();
                cleaned += 1;
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENS: Generations = Generations {
        stable: 4,
        unstable: 5,
    };

    #[test]
    fn slot_classification() {
        assert_eq!(GspSlot::default().state(GENS), SlotState::Empty);
        assert_eq!(GspSlot::new(3, PageId(9)).state(GENS), SlotState::Stable);
        assert_eq!(GspSlot::new(5, PageId(9)).state(GENS), SlotState::Unstable);
        assert_eq!(GspSlot::new(9, PageId(9)).state(GENS), SlotState::Broken);
        assert_eq!(GspSlot::new(0, PageId(0)).state(GENS), SlotState::Broken);
        let crashed = Generations {
            stable: 4,
            unstable: 7,
        };
        assert_eq!(GspSlot::new(5, PageId(9)).state(crashed), SlotState::Crashed);
        let mut torn = GspSlot::new(3, PageId(9));
        torn.pointer = 10;
        assert_eq!(torn.state(GENS), SlotState::Broken);
    }

    #[test]
    fn resolve_prefers_newest_valid_slot() {
        let mut gsp = Gsp::single(PageId(10), 2);
        assert_eq!(gsp.resolve(GENS).unwrap(), PageId(10));
        assert_eq!(gsp.write(PageId(11), GENS), 1);
        assert_eq!(gsp.resolve(GENS).unwrap(), PageId(11));
        assert_eq!(gsp.resolve_stable(GENS).unwrap(), PageId(10));
        assert_eq!(gsp.write(PageId(12), GENS), 1, "unstable slot is reused");
        assert_eq!(gsp.resolve(GENS).unwrap(), PageId(12));
    }

    #[test]
    fn previous_slot_is_the_older_valid_one() {
        let mut gsp = Gsp::single(PageId(10), 3);
        assert_eq!(gsp.resolve_previous(GENS), None);
        assert!(!gsp.has_unstable(GENS));
        gsp.write(PageId(11), GENS);
        assert!(gsp.has_unstable(GENS));
        assert_eq!(gsp.resolve(GENS).unwrap(), PageId(11));
        assert_eq!(gsp.resolve_previous(GENS), Some(PageId(10)));
    }

    #[test]
    fn write_keeps_newest_stable_slot() {
        let mut gsp = Gsp {
            slots: [GspSlot::new(4, PageId(20)), GspSlot::new(2, PageId(21))],
        };
        assert_eq!(gsp.write(PageId(22), GENS), 1);
        assert_eq!(gsp.slots[0], GspSlot::new(4, PageId(20)));
        assert_eq!(gsp.resolve(GENS).unwrap(), PageId(22));
    }

    #[test]
    fn crash_pointer_is_ignored_then_cleaned() {
        let mut gsp = Gsp::single(PageId(30), 4);
        gsp.write(PageId(31), GENS);
        // The session at generation 5 crashed; the next one writes at 6.
        let reopened = Generations {
            stable: 4,
            unstable: 6,
        };
        assert_eq!(gsp.resolve(reopened).unwrap(), PageId(30));
        assert_eq!(gsp.crashed_slots(reopened), 1);
        assert_eq!(gsp.clean(reopened), 1);
        assert_eq!(gsp.clean(reopened), 0, "cleaning twice is a no-op");
        assert_eq!(gsp.resolve(reopened).unwrap(), PageId(30));
        assert_eq!(gsp.slots[1], GspSlot::default());
    }

    #[test]
    fn crashed_slot_is_reused_by_writer() {
        let mut gsp = Gsp::single(PageId(30), 4);
        gsp.write(PageId(31), GENS);
        let reopened = Generations {
            stable: 4,
            unstable: 6,
        };
        assert_eq!(gsp.write(PageId(32), reopened), 1);
        assert_eq!(gsp.crashed_slots(reopened), 0);
        assert_eq!(gsp.resolve(reopened).unwrap(), PageId(32));
    }

    #[test]
    fn pointer_without_valid_slot_is_corruption() {
        let gsp = Gsp::default();
        assert!(gsp.resolve(GENS).unwrap_err().is_corruption());
        let only_unstable = Gsp::single(PageId(3), 5);
        assert!(only_unstable.resolve_stable(GENS).is_err());
    }

    #[test]
    fn encode_decode_preserves_both_slots() {
        let gsp = Gsp {
            slots: [GspSlot::new(3, PageId(7)), GspSlot::new(5, PageId(8))],
        };
        let mut buf = [0u8; GSP_LEN];
        gsp.encode(&mut buf);
        assert_eq!(Gsp::decode(&buf).unwrap(), gsp);
        assert!(Gsp::decode(&buf[..GSP_LEN - 1]).is_err());
    }

    #[test]
    fn advance_publishes_unstable() {
        let next = GENS.advanced();
        assert_eq!(next.stable, 5);
        assert_eq!(next.unstable, 6);
        assert!(next.is_stable(5));
        assert!(!GENS.is_stable(5));
    }
}
