//! Core addressing types shared by the allocator, the slice index and the
//! binlog: `BlockKey`, `SliceSize`, `TrunkId`, `TrunkSpace`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Fixed logical block size; every `BlockKey::offset` is a multiple of this.
pub const BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Logical address of an object-block: `(object id, aligned offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub oid: u64,
    pub offset: u64,
}

impl BlockKey {
    pub fn new(oid: u64, offset: u64) -> Self {
        debug_assert_eq!(offset % BLOCK_SIZE, 0, "block offset must be block-aligned");
        BlockKey { oid, offset }
    }

    /// Bucket-selecting hash, matching the source's `oid + offset / BLOCK_SIZE`.
    pub fn hash_code(&self) -> u64 {
        self.oid.wrapping_add(self.offset / BLOCK_SIZE)
    }
}

/// A byte range within a block: `(offset, length)`, `offset + length <= BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceSize {
    pub offset: u32,
    pub length: u32,
}

impl SliceSize {
    pub fn new(offset: u32, length: u32) -> Self {
        assert!(
            (offset as u64) + (length as u64) <= BLOCK_SIZE,
            "slice range exceeds block size"
        );
        SliceSize { offset, length }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    pub fn overlaps(&self, other: &SliceSize) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Identity of a trunk file: `<store-path>/<subdir>/<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrunkId {
    pub subdir: u32,
    pub id: u64,
}

/// A physical extent: which store path, which trunk, where, how big.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrunkSpace {
    pub path_index: u32,
    pub trunk_id: TrunkId,
    pub file_offset: u64,
    pub size: u32,
}

/// A reference-counted record describing one physically stored slice.
///
/// `ref_count` starts at 1 for the copy held by the index's skiplist; readers
/// bump it while a result array is alive and drop it again on release.
/// Trimmed read-only duplicates produced by `get_slices` always start at 1
/// and are never inserted back into the index.
#[derive(Debug)]
pub struct SliceEntry {
    pub owning_block: BlockKey,
    pub ssize: SliceSize,
    pub space: TrunkSpace,
    ref_count: AtomicU32,
}

impl SliceEntry {
    pub fn new(owning_block: BlockKey, ssize: SliceSize, space: TrunkSpace) -> Arc<Self> {
        Arc::new(SliceEntry {
            owning_block,
            ssize,
            space,
            ref_count: AtomicU32::new(1),
        })
    }

    /// A read-only duplicate with a narrowed range pointing at the same
    /// physical space, used by `get_slices` for the trimmed head/tail of a
    /// query range. Always starts life with `ref_count == 1`.
    pub fn trimmed_duplicate(&self, ssize: SliceSize) -> Arc<Self> {
        Arc::new(SliceEntry {
            owning_block: self.owning_block,
            ssize,
            space: self.space,
            ref_count: AtomicU32::new(1),
        })
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases one reference. Returns `true` if this was the last one and
    /// the caller is responsible for freeing the backing trunk space.
    /// Idempotent against double-release below zero: a reference already at
    /// zero is left untouched and reports `false`, the slice was already
    /// freed by someone else's drop of the last ref.
    pub fn release(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current == 1,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_key_hash_code_matches_formula() {
        let bk = BlockKey::new(7, 2 * BLOCK_SIZE);
        assert_eq!(bk.hash_code(), 9);
    }

    #[test]
    fn slice_size_overlap_detection() {
        let a = SliceSize::new(0, 100);
        let b = SliceSize::new(40, 60);
        let c = SliceSize::new(100, 50);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn idempotent_release_never_goes_negative() {
        let space = TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: 0,
            size: 100,
        };
        let slice = SliceEntry::new(BlockKey::new(1, 0), SliceSize::new(0, 100), space);
        assert!(slice.release());
        assert!(!slice.release());
        assert_eq!(slice.ref_count(), 0);
    }
}
