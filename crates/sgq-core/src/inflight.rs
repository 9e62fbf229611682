//! In-flight request tracking
//!
//! Maps each outstanding pack_id to the buffer the driver is writing into or
//! reading from. A slot is inserted once at submission and removed exactly
//! once at completion.

use crate::buffer::AlignedBuf;
use crate::error::EngineError;
use rustc_hash::FxHashMap;
use std::time::Instant;

/// One outstanding request.
#[derive(Debug)]
pub struct Slot {
    /// Buffer owned by the request.
    pub buf: AlignedBuf,
    /// Target LBA for read/write commands.
    pub lba: Option<u64>,
    /// When the request entered the driver.
    pub submitted_at: Instant,
}

/// Outstanding requests of one worker.
#[derive(Debug, Default)]
pub struct InFlight {
    slots: FxHashMap<i32, Slot>,
}

impl InFlight {
    /// Empty map sized for `depth` requests.
    pub fn with_capacity(depth: usize) -> Self {
        Self {
            slots: FxHashMap::with_capacity_and_hasher(depth, Default::default()),
        }
    }

    /// Track `pack_id`; a second insert of the same id is an error.
    pub fn insert(&mut self, pack_id: i32, slot: Slot) -> Result<(), EngineError> {
        if self.slots.contains_key(&pack_id) {
            return Err(EngineError::DuplicatePackId(pack_id));
        }
        self.slots.insert(pack_id, slot);
        Ok(())
    }

    /// Stop tracking `pack_id`, handing back its slot.
    pub fn remove(&mut self, pack_id: i32) -> Result<Slot, EngineError> {
        self.slots
            .remove(&pack_id)
            .ok_or(EngineError::UnknownPackId(pack_id))
    }

    /// Whether `pack_id` is outstanding.
    pub fn contains(&self, pack_id: i32) -> bool {
        self.slots.contains_key(&pack_id)
    }

    /// Longest-outstanding pack_id.
    pub fn oldest(&self) -> Option<i32> {
        self.slots
            .iter()
            .min_by_key(|(id, slot)| (slot.submitted_at, **id))
            .map(|(id, _)| *id)
    }

    /// Slot of an outstanding request.
    pub fn get(&self, pack_id: i32) -> Option<&Slot> {
        self.slots.get(&pack_id)
    }

    /// The first `written` sense bytes of an outstanding request, capped at
    /// the sense area.
    pub fn sense_of(&self, pack_id: i32, written: usize) -> Option<&[u8]> {
        self.slots.get(&pack_id).map(|s| {
            let sense = s.buf.sense();
            &sense[..written.min(sense.len())]
        })
    }

    /// Outstanding count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove every slot, yielding the buffers.
    pub fn drain(&mut self) -> impl Iterator<Item = AlignedBuf> + '_ {
        self.slots.drain().map(|(_, slot)| slot.buf)
    }
}
