//! Ordered-map index backend.
//!
//! A `BTreeMap` keyed by needle id. Slower point lookups than the compact
//! map but visits entries in key order, which compaction relies on to keep
//! the rewritten `.dat` file ordered and which makes sync deltas cheap to
//! diff. Tombstones stay in the map so `get` can distinguish "deleted" from
//! "never existed".

use std::collections::BTreeMap;

use needlehouse_core::needle::NeedleId;

use super::{IndexEntry, NeedleIndex, TOMBSTONE_SIZE};
use crate::error::Result;

pub struct BTreeIndex {
    entries: BTreeMap<NeedleId, IndexEntry>,
    live: usize,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            live: 0,
        }
    }

    /// All entries including tombstones, in key order. Used by the sorted
    /// backend's bulk build.
    pub(crate) fn raw_entries(&self) -> impl Iterator<Item = (NeedleId, IndexEntry)> + '_ {
        self.entries.iter().map(|(id, entry)| (*id, *entry))
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }
}

impl Default for BTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl NeedleIndex for BTreeIndex {
    fn get(&self, id: NeedleId) -> Option<IndexEntry> {
        self.entries.get(&id).copied()
    }

    fn put(&mut self, id: NeedleId, entry: IndexEntry) -> Option<IndexEntry> {
        let old = self.entries.insert(id, entry);
        match old {
            Some(old) if !old.is_tombstone() => Some(old),
            _ => {
                self.live += 1;
                None
            }
        }
    }

    fn delete(&mut self, id: NeedleId) -> Option<IndexEntry> {
        let slot = self.entries.get_mut(&id)?;
        if slot.is_tombstone() {
            return None;
        }
        let old = *slot;
        *slot = IndexEntry::new(old.offset, TOMBSTONE_SIZE);
        self.live -= 1;
        Some(old)
    }

    fn visit(&self, f: &mut dyn FnMut(NeedleId, IndexEntry) -> Result<()>) -> Result<()> {
        for (id, entry) in &self.entries {
            if entry.is_tombstone() {
                continue;
            }
            f(*id, *entry)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.live
    }
}
