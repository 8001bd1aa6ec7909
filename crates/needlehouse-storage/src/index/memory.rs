//! Chunked Compact Map - the default in-RAM index backend
//!
//! Needle ids handed out by the sequencer are dense, so a plain hash map
//! would pay pointer-and-hash overhead for keys that are effectively array
//! indexes. This backend instead shards the id space into segments of 2^20
//! consecutive ids (`id >> 20` selects the segment) and stores each segment
//! as one dense array of [`IndexEntry`]. A segment is allocated on first
//! touch, so resident memory is bounded by the id ranges actually in use
//! rather than the full 64-bit key space.
//!
//! Lookups are two array indexes; no hashing, no per-entry allocation.
//! Visit order follows segment and slot order, which callers must treat as
//! unspecified.

use std::collections::BTreeMap;

use needlehouse_core::needle::NeedleId;

use super::{IndexEntry, NeedleIndex, TOMBSTONE_SIZE};
use crate::error::Result;

const SEGMENT_BITS: u32 = 20;
const SEGMENT_SIZE: usize = 1 << SEGMENT_BITS;
const SLOT_MASK: u64 = (SEGMENT_SIZE as u64) - 1;

pub struct CompactMapIndex {
    segments: BTreeMap<u64, Vec<IndexEntry>>,
    live: usize,
}

impl CompactMapIndex {
    pub fn new() -> Self {
        Self {
            segments: BTreeMap::new(),
            live: 0,
        }
    }

    fn slot(&self, id: NeedleId) -> Option<IndexEntry> {
        self.segments
            .get(&(id >> SEGMENT_BITS))
            .map(|seg| seg[(id & SLOT_MASK) as usize])
    }
}

impl Default for CompactMapIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl NeedleIndex for CompactMapIndex {
    fn get(&self, id: NeedleId) -> Option<IndexEntry> {
        self.slot(id).filter(|entry| !entry.is_empty())
    }

    fn put(&mut self, id: NeedleId, entry: IndexEntry) -> Option<IndexEntry> {
        let segment = self
            .segments
            .entry(id >> SEGMENT_BITS)
            .or_insert_with(|| vec![IndexEntry::EMPTY; SEGMENT_SIZE]);
        let slot = &mut segment[(id & SLOT_MASK) as usize];
        let old = *slot;
        *slot = entry;
        if old.is_empty() || old.is_tombstone() {
            self.live += 1;
            None
        } else {
            Some(old)
        }
    }

    fn delete(&mut self, id: NeedleId) -> Option<IndexEntry> {
        let segment = self.segments.get_mut(&(id >> SEGMENT_BITS))?;
        let slot = &mut segment[(id & SLOT_MASK) as usize];
        let old = *slot;
        if old.is_empty() || old.is_tombstone() {
            return None;
        }
        *slot = IndexEntry::new(old.offset, TOMBSTONE_SIZE);
        self.live -= 1;
        Some(old)
    }

    fn visit(&self, f: &mut dyn FnMut(NeedleId, IndexEntry) -> Result<()>) -> Result<()> {
        for (segment_key, segment) in &self.segments {
            for (slot, entry) in segment.iter().enumerate() {
                if entry.is_empty() || entry.is_tombstone() {
                    continue;
                }
                f((segment_key << SEGMENT_BITS) | slot as u64, *entry)?;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_across_segment_boundary() {
        let mut index = CompactMapIndex::new();
        let low = 5u64;
        let high = (3u64 << SEGMENT_BITS) + 5; // same slot, different segment
        index.put(low, IndexEntry::new(1, 10));
        index.put(high, IndexEntry::new(2, 20));
        assert_eq!(index.get(low), Some(IndexEntry::new(1, 10)));
        assert_eq!(index.get(high), Some(IndexEntry::new(2, 20)));
        assert_eq!(index.segments.len(), 2);
    }

    #[test]
    fn test_visit_reconstructs_ids() {
        let mut index = CompactMapIndex::new();
        let ids = [1u64, (1 << SEGMENT_BITS) + 7, (5 << SEGMENT_BITS) + 123];
        for id in ids {
            index.put(id, IndexEntry::new(9, 9));
        }
        let mut seen = Vec::new();
        index
            .visit(&mut |id, _| {
                seen.push(id);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, ids.to_vec());
    }

    #[test]
    fn test_live_count_through_overwrite_and_delete() {
        let mut index = CompactMapIndex::new();
        index.put(1, IndexEntry::new(1, 1));
        index.put(1, IndexEntry::new(2, 2));
        assert_eq!(index.len(), 1);
        index.delete(1);
        assert_eq!(index.len(), 0);
        // Re-put after delete revives the slot
        index.put(1, IndexEntry::new(3, 3));
        assert_eq!(index.len(), 1);
    }
}
