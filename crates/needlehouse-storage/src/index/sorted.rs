//! Sorted-array index backend.
//!
//! The `.idx` journal is frozen into one sorted array at load time; point
//! lookups are a binary search with no per-entry pointers, which makes this
//! the cheapest backend per resident entry for read-mostly volumes. Writes
//! that arrive after the freeze land in a small overflow map that shadows
//! the array; the overflow folds back into the array on the next journal
//! rewrite (compaction).

use std::collections::BTreeMap;

use needlehouse_core::needle::NeedleId;

use super::btree::BTreeIndex;
use super::{IndexEntry, NeedleIndex, TOMBSTONE_SIZE};
use crate::error::Result;

#[derive(Default)]
pub struct SortedStringIndex {
    /// Sorted by id; may contain tombstones.
    base: Vec<(NeedleId, IndexEntry)>,
    /// Entries written after the freeze; shadows `base`.
    overflow: BTreeMap<NeedleId, IndexEntry>,
    live: usize,
}

impl SortedStringIndex {
    /// Freeze a bulk-loaded ordered map into the array form.
    pub fn from_btree(staging: &BTreeIndex) -> Self {
        Self {
            base: staging.raw_entries().collect(),
            overflow: BTreeMap::new(),
            live: staging.live_count(),
        }
    }

    fn lookup(&self, id: NeedleId) -> Option<IndexEntry> {
        if let Some(entry) = self.overflow.get(&id) {
            return Some(*entry);
        }
        self.base
            .binary_search_by_key(&id, |(key, _)| *key)
            .ok()
            .map(|pos| self.base[pos].1)
    }
}

impl NeedleIndex for SortedStringIndex {
    fn get(&self, id: NeedleId) -> Option<IndexEntry> {
        self.lookup(id)
    }

    fn put(&mut self, id: NeedleId, entry: IndexEntry) -> Option<IndexEntry> {
        let old = self.lookup(id);
        self.overflow.insert(id, entry);
        match old {
            Some(old) if !old.is_tombstone() => Some(old),
            _ => {
                self.live += 1;
                None
            }
        }
    }

    fn delete(&mut self, id: NeedleId) -> Option<IndexEntry> {
        let old = self.lookup(id)?;
        if old.is_tombstone() {
            return None;
        }
        self.overflow
            .insert(id, IndexEntry::new(old.offset, TOMBSTONE_SIZE));
        self.live -= 1;
        Some(old)
    }

    fn visit(&self, f: &mut dyn FnMut(NeedleId, IndexEntry) -> Result<()>) -> Result<()> {
        // Merge the two key-ordered streams; overflow shadows base.
        let mut overflow = self.overflow.iter().peekable();
        for (id, entry) in &self.base {
            // Emit overflow-only entries that sort before this base entry.
            while overflow.peek().map(|(k, _)| **k < *id).unwrap_or(false) {
                let (over_id, over_entry) = overflow.next().expect("peeked");
                if !over_entry.is_tombstone() {
                    f(*over_id, *over_entry)?;
                }
            }
            let effective = if overflow.peek().map(|(k, _)| **k) == Some(*id) {
                *overflow.next().expect("peeked").1
            } else {
                *entry
            };
            if !effective.is_tombstone() {
                f(*id, effective)?;
            }
        }
        for (id, entry) in overflow {
            if !entry.is_tombstone() {
                f(*id, *entry)?;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.live
    }
}
