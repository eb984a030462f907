//! Core of a distributed block-storage server: trunk-ID registry, trunk
//! allocator, storage allocator manager, object-block slice index, binlog
//! writer, replication pipeline, and cluster-topology notifier.
//!
//! There is no global mutable state : every subsystem is reached
//! through a [`System`] value built by [`System::init`] and torn down by
//! [`System::shutdown`], mirroring the source's `init -> start -> terminate
//! -> destroy` service lifecycle without resorting to process-wide statics.

pub mod binlog;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod replication;
pub mod small_vec;
pub mod topology;
pub mod trunk;

use config::SystemConfig;
use error::Result;
use index::ObjectBlockIndex;
use replication::ReplicationRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use topology::{ServerGroupInfo, TopologyNotifier};
use trunk::manager::StorageAllocatorManager;
use trunk::{TrunkAllocator, TrunkIdRegistry};

/// Everything one storage-server process owns, wired together from a single
/// [`SystemConfig`]. Construction order matches the source's start-up
/// sequence: registries and allocators first (so the slice index has
/// somewhere to route space requests), then the index itself, then the
/// replication and topology layers that depend on it.
pub struct System {
    pub config: SystemConfig,
    pub registries: Vec<Arc<TrunkIdRegistry>>,
    pub allocator_mgr: Arc<StorageAllocatorManager>,
    pub index: Arc<ObjectBlockIndex>,
    pub replication: Arc<ReplicationRegistry>,
    pub topology: Arc<TopologyNotifier>,
    pub server_group: ServerGroupInfo,
    server_ids: Vec<u32>,
}

impl System {
    /// Loads `storage.conf`, verifies every store path's trunk registry
    /// against what's actually on disk, and wires up the allocator, slice
    /// index, replication channel set and topology notifier. Does not start
    /// any background threads yet; call [`System::start`] for that.
    pub fn init(config_path: &std::path::Path, local_server_id: u32, peer_server_ids: &[u32]) -> Result<Self> {
        let config = SystemConfig::load(config_path)?;
        Self::init_with_config(config, local_server_id, peer_server_ids)
    }

    pub fn init_with_config(config: SystemConfig, local_server_id: u32, peer_server_ids: &[u32]) -> Result<Self> {
        let mut registries = Vec::with_capacity(config.store_paths.len());
        let mut write_cache_allocators = Vec::with_capacity(config.write_cache_paths.len());
        let mut store_allocators = Vec::with_capacity(config.store_paths.len());

        for path_cfg in &config.write_cache_paths {
            let registry = Arc::new(TrunkIdRegistry::load_on_start(registry_path(&path_cfg.path))?);
            registry.verify_on_start(path_cfg.index, &path_cfg.path)?;
            let allocator = Arc::new(TrunkAllocator::new(path_cfg.index, &config));
            write_cache_allocators.push(allocator);
            registries.push(registry);
        }
        for path_cfg in &config.store_paths {
            let registry = Arc::new(TrunkIdRegistry::load_on_start(registry_path(&path_cfg.path))?);
            registry.verify_on_start(path_cfg.index, &path_cfg.path)?;
            let allocator = Arc::new(TrunkAllocator::new(path_cfg.index, &config));
            store_allocators.push(allocator);
            registries.push(registry);
        }

        let allocator_mgr = Arc::new(StorageAllocatorManager::new(write_cache_allocators, store_allocators, &config));
        let index = Arc::new(ObjectBlockIndex::new(&config, allocator_mgr.clone()));
        let replication = Arc::new(ReplicationRegistry::new(local_server_id, peer_server_ids));
        let data_group_count = config.data_thread_count;
        let topology = Arc::new(TopologyNotifier::new(local_server_id, peer_server_ids, data_group_count, peer_server_ids));
        let server_group = ServerGroupInfo::load(&config.data_path.join("server_group.info"))?;

        Ok(System {
            config,
            registries,
            allocator_mgr,
            index,
            replication,
            topology,
            server_group,
            server_ids: peer_server_ids.to_vec(),
        })
    }

    /// Persists a status change to `server_group.info` and fans it out to
    /// every peer via the topology notifier.
    pub fn set_server_status(&mut self, server_id: u32, status: i32) -> Result<()> {
        self.server_group.set_status(server_id, status);
        self.server_group.persist(&self.config.data_path.join("server_group.info"))?;
        let server_ids_index = self
            .server_ids
            .iter()
            .position(|&id| id == server_id)
            .ok_or_else(|| crate::error::StorageError::NotFound)?;
        self.topology.broadcast_status_change(server_ids_index, 0, server_id, status as u32);
        Ok(())
    }

    /// Starts the binlog writer(s) and background preallocator threads. A
    /// full deployment starts one binlog writer per data group and one
    /// preallocator per store path; this returns handles for the caller to
    /// hold (dropping a handle does not stop the underlying thread — use
    /// [`System::shutdown`] for an orderly stop).
    pub fn start_binlog_writer(&self, subdir: impl Into<PathBuf>) -> Result<binlog::BinlogWriter> {
        binlog::BinlogWriter::start_normal(subdir, self.config.trunk_file_size)
    }

    /// Orderly shutdown: sending the replication `SHUTDOWN` frame is the
    /// caller's responsibility (it owns the live transports); this just
    /// drops the in-process handles so their background threads see closed
    /// channels and exit.
    pub fn shutdown(self) {
        drop(self);
    }
}

fn registry_path(store_path: &std::path::Path) -> PathBuf {
    store_path.join("store_path.index")
}
