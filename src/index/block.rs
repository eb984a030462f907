//! `BlockEntry`: one logical block's ordered set of slices.
//!
//! The source keys this by a unique skiplist so it can `find_ge` and then
//! walk forward/backward from that node. A `BTreeMap<u32, Arc<SliceEntry>>`
//! keyed by `ssize.offset` gives the same `find_ge`/bidirectional-walk shape
//! through `BTreeMap::range` and `DoubleEndedIterator`, without hand-rolling
//! a skiplist the rest of the crate has no other use for.

use crate::model::{BlockKey, SliceEntry, SliceSize};
use crate::small_vec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct BlockEntry {
    pub bkey: BlockKey,
    slices: BTreeMap<u32, Arc<SliceEntry>>,
}

/// Outcome of `add_slice`: which slices were newly inserted and which were
/// removed, so the caller (the shared context) can mirror both lists into
/// the trunk allocator while holding the same lock.
pub struct AddSliceOutcome {
    pub inserted: SmallVec<Arc<SliceEntry>>,
    pub removed: SmallVec<Arc<SliceEntry>>,
}

impl BlockEntry {
    pub fn new(bkey: BlockKey) -> Self {
        BlockEntry {
            bkey,
            slices: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Inserts `slice`, trimming or deleting any existing slices it
    /// overlaps, keeping slices within a block non-overlapping. Mirrors
    /// `add_slice` in `object_block_index.c` step for step:
    /// 1. find the first existing slice with `offset >= slice.offset`
    /// 2. if its predecessor overlaps the new slice's head, trim/delete it
    /// 3. walk forward deleting/trimming everything the new slice covers
    /// 4. insert the new slice
    pub fn add_slice(&mut self, slice: Arc<SliceEntry>) -> AddSliceOutcome {
        let mut inserted = SmallVec::new();
        let mut removed = SmallVec::new();
        let new_start = slice.ssize.offset;
        let new_end = slice.ssize.end();

        // Step 2: predecessor of the first slice at or after `new_start`.
        if let Some((&prev_offset, prev)) = self.slices.range(..new_start).next_back() {
            let prev_end = prev.ssize.end();
            if prev_end > new_start {
                let prev = prev.clone();
                self.slices.remove(&prev_offset);
                removed.push(prev.clone());

                let head = prev.trimmed_duplicate(SliceSize::new(prev.ssize.offset, new_start - prev.ssize.offset));
                self.slices.insert(head.ssize.offset, head.clone());
                inserted.push(head);

                if prev_end > new_end {
                    let tail = prev.trimmed_duplicate(SliceSize::new(new_end, prev_end - new_end));
                    self.slices.insert(tail.ssize.offset, tail.clone());
                    inserted.push(tail);
                }
            }
        }

        // Step 3: walk forward from the first slice at or after `new_start`,
        // deleting anything the new range covers and trimming the tail of
        // the last one if it extends past `new_end`.
        let overlapping: Vec<u32> = self
            .slices
            .range(new_start..)
            .take_while(|(&offset, _)| offset < new_end)
            .map(|(&offset, _)| offset)
            .collect();
        for offset in overlapping {
            let curr = self.slices.remove(&offset).expect("offset collected from live map");
            removed.push(curr.clone());
            let curr_end = curr.ssize.end();
            if curr_end > new_end {
                let tail = curr.trimmed_duplicate(SliceSize::new(new_end, curr_end - new_end));
                self.slices.insert(tail.ssize.offset, tail.clone());
                inserted.push(tail);
            }
        }

        self.slices.insert(slice.ssize.offset, slice.clone());
        inserted.push(slice);

        AddSliceOutcome { inserted, removed }
    }

    /// Ordered list of slices intersecting `[offset, offset+length)`. The
    /// first and last overlapping slices are returned as trimmed read-only
    /// duplicates (never inserted into the map); interior slices are
    /// returned via a fresh `Arc` clone (ref-count bump).
    pub fn get_slices(&self, offset: u32, length: u32) -> SmallVec<Arc<SliceEntry>> {
        let end = offset + length;
        let mut result = SmallVec::new();
        for (&slice_offset, slice) in self.slices.iter() {
            let slice_end = slice.ssize.end();
            if slice_end <= offset {
                continue;
            }
            if slice_offset >= end {
                break;
            }
            let clamped_start = slice_offset.max(offset);
            let clamped_end = slice_end.min(end);
            if clamped_start == slice.ssize.offset && clamped_end == slice_end {
                slice.add_ref();
                result.push(slice.clone());
            } else {
                result.push(slice.trimmed_duplicate(SliceSize::new(clamped_start, clamped_end - clamped_start)));
            }
        }
        result
    }

    pub fn remove_slice(&mut self, offset: u32) -> Option<Arc<SliceEntry>> {
        self.slices.remove(&offset)
    }

    pub fn all_slices(&self) -> impl Iterator<Item = &Arc<SliceEntry>> {
        self.slices.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TrunkId, TrunkSpace};

    fn space(offset: u64, size: u32) -> TrunkSpace {
        TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: offset,
            size,
        }
    }

    fn bkey() -> BlockKey {
        BlockKey::new(7, 0)
    }

    #[test]
    fn round_trip_single_slice() {
        let mut block = BlockEntry::new(bkey());
        let slice = SliceEntry::new(bkey(), SliceSize::new(0, 4096), space(0, 4096));
        block.add_slice(slice);
        let result = block.get_slices(0, 4096);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].ssize, SliceSize::new(0, 4096));
    }

    #[test]
    fn overwrite_splits_original_into_two_trimmed_views() {
        let mut block = BlockEntry::new(bkey());
        let original_space = space(1000, 100);
        block.add_slice(SliceEntry::new(bkey(), SliceSize::new(0, 100), original_space));
        let outcome = block.add_slice(SliceEntry::new(bkey(), SliceSize::new(40, 20), space(5000, 20)));
        assert_eq!(outcome.removed.len(), 1);

        let result = block.get_slices(0, 100);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].ssize, SliceSize::new(0, 40));
        assert_eq!(result[0].space.file_offset, 1000);
        assert_eq!(result[1].ssize, SliceSize::new(40, 20));
        assert_eq!(result[1].space.file_offset, 5000);
        assert_eq!(result[2].ssize, SliceSize::new(60, 40));
        assert_eq!(result[2].space.file_offset, 1000);
    }

    #[test]
    fn full_overwrite_removes_all_priors() {
        let mut block = BlockEntry::new(bkey());
        block.add_slice(SliceEntry::new(bkey(), SliceSize::new(0, 1000), space(0, 1000)));
        block.add_slice(SliceEntry::new(bkey(), SliceSize::new(1000, 3000), space(2000, 3000)));
        let outcome = block.add_slice(SliceEntry::new(bkey(), SliceSize::new(0, 4096), space(9000, 4096)));
        assert_eq!(outcome.removed.len(), 2);
        let result = block.get_slices(0, 4096);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].space.file_offset, 9000);
    }

    #[test]
    fn get_slices_on_empty_block_returns_empty() {
        let block = BlockEntry::new(bkey());
        assert!(block.get_slices(0, 4096).is_empty());
    }

    #[quickcheck_macros::quickcheck]
    fn property_no_two_stored_slices_ever_overlap(writes: Vec<(u16, u16)>) -> bool {
        let mut block = BlockEntry::new(bkey());
        for (raw_offset, raw_length) in writes {
            let offset = raw_offset as u32;
            let length = (raw_length as u32).max(1).min(4096 - offset.min(4095));
            if offset as u64 + length as u64 > 4096 {
                continue;
            }
            block.add_slice(SliceEntry::new(bkey(), SliceSize::new(offset, length), space(offset as u64, length)));
        }
        let stored: Vec<SliceSize> = block.all_slices().map(|s| s.ssize).collect();
        stored.windows(2).all(|pair| pair[0].end() <= pair[1].offset)
    }
}
