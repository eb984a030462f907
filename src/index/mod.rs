//! Object-block slice index : an in-memory map of
//! `(object-id, aligned-offset) -> ordered set of slices` sharded across
//! `shared_locks_count` lock contexts.

pub mod block;

use crate::config::SystemConfig;
use crate::error::{Result, StorageError};
use crate::model::{BlockKey, SliceEntry, SliceSize, TrunkSpace};
use crate::small_vec::SmallVec;
use crate::trunk::manager::StorageAllocatorManager;
use block::BlockEntry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One of `shared_locks_count` independently locked partitions of the
/// hashtable. Bucket `b` (computed from `BlockKey::hash_code() %
/// hashtable_capacity`) is served by context `b % shared_locks_count`.
/// Collapsing the source's per-bucket chain into one sorted map per shard
/// keeps every bucket's required chain order intact as a byproduct.
struct SharedContext {
    blocks: RwLock<BTreeMap<BlockKey, BlockEntry>>,
}

impl SharedContext {
    fn new() -> Self {
        SharedContext {
            blocks: RwLock::new(BTreeMap::new()),
        }
    }
}

/// The full object-block slice index: `hashtable_capacity` conceptual
/// buckets, sharded across `shared_locks_count` lock contexts, each owning a
/// disjoint slice of the `BlockKey` space.
pub struct ObjectBlockIndex {
    hashtable_capacity: u64,
    shared: Vec<SharedContext>,
    allocator_mgr: Arc<StorageAllocatorManager>,
    block_count: AtomicU64,
}

impl ObjectBlockIndex {
    pub fn new(cfg: &SystemConfig, allocator_mgr: Arc<StorageAllocatorManager>) -> Self {
        let shard_count = cfg.object_block_shared_locks_count as usize;
        ObjectBlockIndex {
            hashtable_capacity: cfg.object_block_hashtable_capacity,
            shared: (0..shard_count).map(|_| SharedContext::new()).collect(),
            allocator_mgr,
            block_count: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, bkey: &BlockKey) -> &SharedContext {
        let bucket = bkey.hash_code() % self.hashtable_capacity;
        &self.shared[(bucket as usize) % self.shared.len()]
    }

    /// Inserts a new slice of a block, resolving overlaps
    /// and mirroring every structural delete/insert into the trunk
    /// allocator before the lock is released.
    pub fn add_slice(&self, bkey: BlockKey, ssize: SliceSize, space: TrunkSpace) -> Result<()> {
        let shard = self.shard_for(&bkey);
        let mut blocks = shard.blocks.write();
        let is_new_block = !blocks.contains_key(&bkey);
        let block = blocks.entry(bkey).or_insert_with(|| BlockEntry::new(bkey));
        if is_new_block {
            self.block_count.fetch_add(1, Ordering::Relaxed);
        }

        let slice = SliceEntry::new(bkey, ssize, space);
        let outcome = block.add_slice(slice);

        for removed in outcome.removed.iter() {
            self.allocator_mgr.delete_slice(removed.space);
        }
        for inserted in outcome.inserted.iter() {
            self.allocator_mgr.add_slice(inserted.space);
        }
        Ok(())
    }

    /// Reads the ordered slices intersecting `[offset, offset+length)`.
    /// Returns `NOT_FOUND` if the block is absent or the resulting list is
    /// empty.
    pub fn get_slices(&self, bkey: BlockKey, offset: u32, length: u32) -> Result<SmallVec<Arc<SliceEntry>>> {
        let shard = self.shard_for(&bkey);
        let blocks = shard.blocks.read();
        let block = blocks.get(&bkey).ok_or(StorageError::NotFound)?;
        let result = block.get_slices(offset, length);
        if result.is_empty() {
            return Err(StorageError::NotFound);
        }
        Ok(result)
    }

    /// Deletes one slice by exact range, freeing its trunk space if that
    /// was the last reference. A no-op (not an error) if already absent,
    /// matching the idempotent-free testable property.
    pub fn delete_slice(&self, bkey: BlockKey, offset: u32) -> Result<()> {
        let shard = self.shard_for(&bkey);
        let mut blocks = shard.blocks.write();
        let Some(block) = blocks.get_mut(&bkey) else {
            return Ok(());
        };
        if let Some(slice) = block.remove_slice(offset) {
            if slice.release() {
                self.allocator_mgr.delete_slice(slice.space);
            }
        }
        if block.is_empty() {
            blocks.remove(&bkey);
            self.block_count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Deletes an entire block and all its slices, freeing trunk space for
    /// every slice whose last reference this drops.
    pub fn delete_block(&self, bkey: BlockKey) -> Result<()> {
        let shard = self.shard_for(&bkey);
        let mut blocks = shard.blocks.write();
        if let Some(block) = blocks.remove(&bkey) {
            for slice in block.all_slices() {
                if slice.release() {
                    self.allocator_mgr.delete_slice(slice.space);
                }
            }
            self.block_count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TrunkId, BLOCK_SIZE};
    use crate::trunk::allocator::TrunkAllocator;

    fn index_with_allocator() -> (ObjectBlockIndex, Arc<TrunkAllocator>) {
        let cfg = SystemConfig::default();
        let allocator = Arc::new(TrunkAllocator::new(0, &cfg));
        allocator.add_trunk(TrunkId { subdir: 0, id: 1 }, 1024 * 1024);
        let mgr = Arc::new(StorageAllocatorManager::new(vec![], vec![allocator.clone()], &cfg));
        (ObjectBlockIndex::new(&cfg, mgr), allocator)
    }

    fn space(file_offset: u64, size: u32) -> TrunkSpace {
        TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset,
            size,
        }
    }

    #[test]
    fn scenario_1_single_slice_write_then_read() {
        let (index, _allocator) = index_with_allocator();
        let bkey = BlockKey::new(7, 0);
        index.add_slice(bkey, SliceSize::new(0, 4096), space(0, 4096)).unwrap();
        let result = index.get_slices(bkey, 0, 4096).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].ssize, SliceSize::new(0, 4096));
    }

    #[test]
    fn scenario_2_middle_write_trims_original_into_two_views() {
        let (index, _allocator) = index_with_allocator();
        let bkey = BlockKey::new(7, 0);
        index.add_slice(bkey, SliceSize::new(0, 4096), space(0, 4096)).unwrap();
        index.add_slice(bkey, SliceSize::new(1000, 2000), space(5000, 2000)).unwrap();
        let result = index.get_slices(bkey, 0, 4096).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].ssize, SliceSize::new(0, 1000));
        assert_eq!(result[1].ssize, SliceSize::new(1000, 2000));
        assert_eq!(result[2].ssize, SliceSize::new(3000, 1096));
    }

    #[test]
    fn scenario_3_full_block_write_removes_all_priors() {
        let (index, allocator) = index_with_allocator();
        let bkey = BlockKey::new(7, 0);
        index.add_slice(bkey, SliceSize::new(0, 4096), space(0, 4096)).unwrap();
        index.add_slice(bkey, SliceSize::new(1000, 2000), space(5000, 2000)).unwrap();
        index.add_slice(bkey, SliceSize::new(0, 4096), space(9000, 4096)).unwrap();
        let result = index.get_slices(bkey, 0, 4096).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].space.file_offset, 9000);
        // The two prior slices' trunk space must have been released.
        let (_, used) = allocator.total_and_used();
        assert_eq!(used, 4096);
    }

    #[test]
    fn get_slices_not_found_for_absent_block() {
        let (index, _allocator) = index_with_allocator();
        let bkey = BlockKey::new(99, 0);
        assert!(matches!(index.get_slices(bkey, 0, 4096), Err(StorageError::NotFound)));
    }

    #[test]
    fn different_blocks_land_in_independent_shards_without_interference() {
        let (index, _allocator) = index_with_allocator();
        for oid in 0..200u64 {
            let bkey = BlockKey::new(oid, 0);
            index.add_slice(bkey, SliceSize::new(0, 100), space(oid * 100, 100)).unwrap();
        }
        assert_eq!(index.block_count(), 200);
        for oid in 0..200u64 {
            let bkey = BlockKey::new(oid, 0);
            let result = index.get_slices(bkey, 0, 100).unwrap();
            assert_eq!(result[0].space.file_offset, oid * 100);
        }
    }

    #[test]
    fn delete_block_releases_all_slices() {
        let (index, allocator) = index_with_allocator();
        let bkey = BlockKey::new(7, 0);
        index.add_slice(bkey, SliceSize::new(0, 4096), space(0, 4096)).unwrap();
        index.delete_block(bkey).unwrap();
        assert!(matches!(index.get_slices(bkey, 0, 4096), Err(StorageError::NotFound)));
        let (_, used) = allocator.total_and_used();
        assert_eq!(used, 0);
    }

    #[test]
    fn block_offset_must_be_block_aligned_in_debug() {
        // BlockKey::new asserts alignment in debug builds; BLOCK_SIZE is the
        // unit every caller must respect.
        let _ = BlockKey::new(1, BLOCK_SIZE);
    }
}
