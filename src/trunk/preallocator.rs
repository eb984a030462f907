//! Background trunk preallocator: creates new trunk files whenever an
//! allocator's open-trunk count drops below `prealloc_trunks` .
//!
//! Creation order: reserve the id in the registry first, then size the file
//! on disk, then mark it open in the allocator; a failure at either of the
//! later steps rolls the id back out of the registry so it never looks
//! durably allocatable.

use crate::error::Result;
use crate::model::TrunkId;
use crate::trunk::allocator::TrunkAllocator;
use crate::trunk::registry::TrunkIdRegistry;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creates one new trunk of `trunk_file_size` bytes under
/// `store_path/<subdir>/<id>`, registering and rolling back as described
/// above. `next_id` supplies monotonically increasing ids per store path.
pub fn preallocate_one(
    registry: &TrunkIdRegistry,
    allocator: &TrunkAllocator,
    store_path: &Path,
    subdir: u32,
    id: u64,
    trunk_file_size: u64,
) -> Result<TrunkId> {
    let trunk_id = TrunkId { subdir, id };
    registry.add(allocator.path_index(), trunk_id)?;

    let subdir_path = store_path.join(subdir.to_string());
    if let Err(e) = std::fs::create_dir_all(&subdir_path) {
        registry.delete(allocator.path_index(), trunk_id).ok();
        return Err(e.into());
    }

    let file_path = subdir_path.join(id.to_string());
    let result = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&file_path)
        .and_then(|f| f.set_len(trunk_file_size));

    if let Err(e) = result {
        registry.delete(allocator.path_index(), trunk_id).ok();
        std::fs::remove_file(&file_path).ok();
        return Err(e.into());
    }

    allocator.add_trunk(trunk_id, trunk_file_size);
    Ok(trunk_id)
}

/// Handle to a running background preallocator thread for one store path.
pub struct PreallocatorHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl PreallocatorHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        registry: Arc<TrunkIdRegistry>,
        allocator: Arc<TrunkAllocator>,
        store_path: std::path::PathBuf,
        subdir: u32,
        trunk_file_size: u64,
        prealloc_trunks: usize,
        next_id: Arc<AtomicU64>,
        poll_interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_inner = shutdown.clone();
        let join = std::thread::spawn(move || {
            while !shutdown_inner.load(Ordering::Relaxed) {
                while allocator.open_trunk_count() < prealloc_trunks {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = preallocate_one(&registry, &allocator, &store_path, subdir, id, trunk_file_size) {
                        log::error!("trunk preallocation failed for path {}: {err}", store_path.display());
                        break;
                    }
                }
                std::thread::sleep(poll_interval);
            }
        });
        PreallocatorHandle {
            shutdown,
            join: Some(join),
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            join.join().ok();
        }
    }
}

impl Drop for PreallocatorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    #[test]
    fn preallocate_one_creates_file_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TrunkIdRegistry::load_on_start(dir.path().join("store_path.index")).unwrap();
        let allocator = TrunkAllocator::new(0, &SystemConfig::default());
        let store_path = dir.path().join("store0");

        let id = preallocate_one(&registry, &allocator, &store_path, 0, 1, 4096).unwrap();
        assert!(registry.contains(0, id));
        assert_eq!(allocator.open_trunk_count(), 1);
        assert!(store_path.join("0").join("1").exists());
        assert_eq!(std::fs::metadata(store_path.join("0").join("1")).unwrap().len(), 4096);
    }
}
