//! Storage allocator manager : routes allocation requests to the
//! right allocator set (write-cache vs store-path) and picks the allocator
//! within that set by block hash.

use crate::config::SystemConfig;
use crate::error::{Result, StorageError};
use crate::model::TrunkSpace;
use crate::trunk::allocator::TrunkAllocator;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorTier {
    WriteCache,
    StorePath,
}

/// One tier's full set of allocators plus the subset currently available
/// (excludes paths over their reserved-space limit or marked offline).
struct AllocatorContext {
    all: Vec<Arc<TrunkAllocator>>,
    avail: RwLock<Vec<Arc<TrunkAllocator>>>,
}

impl AllocatorContext {
    fn new(all: Vec<Arc<TrunkAllocator>>) -> Self {
        let avail = RwLock::new(all.clone());
        AllocatorContext { all, avail }
    }

    fn avail_count(&self) -> usize {
        self.avail.read().len()
    }

    fn pick(&self, block_hash: u64) -> Option<Arc<TrunkAllocator>> {
        let avail = self.avail.read();
        if avail.is_empty() {
            return None;
        }
        Some(avail[(block_hash as usize) % avail.len()].clone())
    }

    fn mark_unavailable(&self, path_index: u32) {
        self.avail.write().retain(|a| a.path_index() != path_index);
    }

    fn mark_available(&self, path_index: u32) {
        let mut avail = self.avail.write();
        if !avail.iter().any(|a| a.path_index() == path_index) {
            if let Some(allocator) = self.all.iter().find(|a| a.path_index() == path_index) {
                avail.push(allocator.clone());
            }
        }
    }
}

/// Routes allocation requests between the write-cache tier and the store-path
/// tier, flipping `current` during the configured flush window when overall
/// usage is low enough.
pub struct StorageAllocatorManager {
    write_cache: AllocatorContext,
    store_path: AllocatorContext,
    current: RwLock<AllocatorTier>,
    by_path_index: Vec<Arc<TrunkAllocator>>,
    write_cache_to_hd_on_usage: Option<f64>,
}

impl StorageAllocatorManager {
    pub fn new(
        write_cache_allocators: Vec<Arc<TrunkAllocator>>,
        store_path_allocators: Vec<Arc<TrunkAllocator>>,
        cfg: &SystemConfig,
    ) -> Self {
        let mut by_path_index: Vec<Arc<TrunkAllocator>> = Vec::new();
        for a in store_path_allocators.iter().chain(write_cache_allocators.iter()) {
            let idx = a.path_index() as usize;
            if by_path_index.len() <= idx {
                by_path_index.resize(idx + 1, a.clone());
            }
            by_path_index[idx] = a.clone();
        }

        let has_write_cache = !write_cache_allocators.is_empty();
        StorageAllocatorManager {
            write_cache: AllocatorContext::new(write_cache_allocators),
            store_path: AllocatorContext::new(store_path_allocators),
            current: RwLock::new(AllocatorTier::StorePath),
            by_path_index,
            write_cache_to_hd_on_usage: cfg.write_cache_to_hd.map(|w| w.on_usage_ratio).filter(|_| has_write_cache),
        }
    }

    fn context(&self, tier: AllocatorTier) -> &AllocatorContext {
        match tier {
            AllocatorTier::WriteCache => &self.write_cache,
            AllocatorTier::StorePath => &self.store_path,
        }
    }

    pub fn current_tier(&self) -> AllocatorTier {
        *self.current.read()
    }

    /// Re-evaluates which tier is `current`. `in_window` is whether wall
    /// clock time currently falls inside the configured
    /// `write_cache_to_hd_start_time..end_time` range (the caller resolves
    /// this from `SystemConfig`, keeping this method a pure function of its
    /// inputs and therefore deterministically testable).
    pub fn refresh_current_tier(&self, in_window: bool, overall_usage_ratio: f64) {
        let Some(on_usage) = self.write_cache_to_hd_on_usage else {
            return;
        };
        let mut current = self.current.write();
        if in_window && overall_usage_ratio < on_usage {
            *current = AllocatorTier::WriteCache;
        } else {
            *current = AllocatorTier::StorePath;
        }
    }

    pub fn set_current_tier(&self, tier: AllocatorTier) {
        *self.current.write() = tier;
    }

    /// Allocates `size` bytes for `block_hash` from whichever tier is
    /// currently selected. Returns `OUT_OF_SPACE` immediately if that tier
    /// has no available allocators (no allocator in the tier is currently available).
    pub fn alloc(&self, block_hash: u64, size: u32) -> Result<TrunkSpace> {
        let tier = self.current_tier();
        let ctx = self.context(tier);
        if ctx.avail_count() == 0 {
            return Err(StorageError::OutOfSpace);
        }
        let allocator = ctx.pick(block_hash).ok_or(StorageError::OutOfSpace)?;
        allocator.alloc_normal(block_hash, size)
    }

    /// Dispatches a slice deletion directly to its owning allocator via the
    /// `allocator_ptr_array` (indexed by store path).
    pub fn delete_slice(&self, space: TrunkSpace) {
        if let Some(allocator) = self.by_path_index.get(space.path_index as usize) {
            allocator.delete_slice(space);
        }
    }

    pub fn add_slice(&self, space: TrunkSpace) {
        if let Some(allocator) = self.by_path_index.get(space.path_index as usize) {
            allocator.add_slice(space);
        }
    }

    pub fn mark_path_unavailable(&self, tier: AllocatorTier, path_index: u32) {
        self.context(tier).mark_unavailable(path_index);
    }

    pub fn mark_path_available(&self, tier: AllocatorTier, path_index: u32) {
        self.context(tier).mark_available(path_index);
    }
}

/// Minutes-since-midnight for the current wall-clock time, used to decide
/// write-cache flush window membership without depending on a particular
/// clock abstraction inside the manager itself.
pub fn minutes_of_day_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((secs / 60) % (24 * 60)) as u32
}

/// Whether `minutes_of_day` falls within `[start, end)`, wrapping past
/// midnight if `end` is earlier than `start`.
pub fn in_flush_window(window: &crate::config::WriteCacheFlushWindow, minutes_of_day: u32) -> bool {
    let start = window.start.hour as u32 * 60 + window.start.minute as u32;
    let end = window.end.hour as u32 * 60 + window.end.minute as u32;
    if start <= end {
        (start..end).contains(&minutes_of_day)
    } else {
        minutes_of_day >= start || minutes_of_day < end
    }
}
