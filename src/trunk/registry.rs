//! Trunk-ID registry : the persistent source of truth for which
//! `(path-index, subdir, trunk-id)` tuples are currently allocatable.
//!
//! Grounded on `storage_allocator.h`'s `trunk_id_info_add`/`_delete` pair.
//! Durability order: an `add` must hit disk before the trunk is handed to
//! the allocator as open; a `delete` must hit disk before the trunk file is
//! unlinked. The on-disk generation counter bumped on every add/delete
//! mirrors `handler.rs`'s `current_generation` counter, bumped the same way
//! on every write.

use crate::error::Result;
use crate::model::TrunkId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: u32 = 0x46535452; // "FSTR"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Entry {
    path_index: u32,
    trunk: TrunkId,
}

/// On-disk, crash-durable registry of live trunk ids, one per store path.
pub struct TrunkIdRegistry {
    file_path: PathBuf,
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    entries: HashSet<Entry>,
    generation: u64,
}

impl TrunkIdRegistry {
    /// Loads `storage/store_path.index`, creating an empty one if absent.
    pub fn load_on_start(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let state = if file_path.exists() {
            Self::read_file(&file_path)?
        } else {
            RegistryState {
                entries: HashSet::new(),
                generation: 0,
            }
        };
        Ok(TrunkIdRegistry {
            file_path,
            inner: Mutex::new(state),
        })
    }

    fn read_file(path: &Path) -> Result<RegistryState> {
        let mut reader = BufReader::new(File::open(path)?);
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(crate::error::StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "store_path.index: bad magic",
            )));
        }
        let generation = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u64::<LittleEndian>()?;
        let mut entries = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            let path_index = reader.read_u32::<LittleEndian>()?;
            let subdir = reader.read_u32::<LittleEndian>()?;
            let id = reader.read_u64::<LittleEndian>()?;
            entries.insert(Entry {
                path_index,
                trunk: TrunkId { subdir, id },
            });
        }
        Ok(RegistryState { entries, generation })
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        let tmp_path = self.file_path.with_extension("index.tmp");
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_u32::<LittleEndian>(MAGIC)?;
            writer.write_u64::<LittleEndian>(state.generation)?;
            writer.write_u64::<LittleEndian>(state.entries.len() as u64)?;
            for entry in &state.entries {
                writer.write_u32::<LittleEndian>(entry.path_index)?;
                writer.write_u32::<LittleEndian>(entry.trunk.subdir)?;
                writer.write_u64::<LittleEndian>(entry.trunk.id)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }

    /// Durably registers a trunk id as allocatable. Must return before the
    /// trunk file is exposed to the allocator as `open`.
    pub fn add(&self, path_index: u32, trunk: TrunkId) -> Result<()> {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.entries.insert(Entry { path_index, trunk });
        self.persist(&state)
    }

    /// Durably removes a trunk id. Must return before the trunk file is
    /// physically unlinked.
    pub fn delete(&self, path_index: u32, trunk: TrunkId) -> Result<()> {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.entries.remove(&Entry { path_index, trunk });
        self.persist(&state)
    }

    /// All trunk ids currently registered for a given store path.
    pub fn enumerate_for_path(&self, path_index: u32) -> Vec<TrunkId> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.path_index == path_index)
            .map(|e| e.trunk)
            .collect()
    }

    pub fn contains(&self, path_index: u32, trunk: TrunkId) -> bool {
        self.inner.lock().entries.contains(&Entry { path_index, trunk })
    }

    /// Cross-checks the registry against the files actually present under
    /// `store_path/<subdir>/<id>` for `path_index`. A file present but not
    /// registered is garbage ; a registered id with no backing
    /// file is a fatal error, since the registry is the source of truth.
    pub fn verify_on_start(&self, path_index: u32, store_path: &Path) -> Result<VerifyReport> {
        let registered = self.enumerate_for_path(path_index);
        let mut on_disk = HashSet::new();
        if store_path.exists() {
            for subdir_entry in std::fs::read_dir(store_path)? {
                let subdir_entry = subdir_entry?;
                let Ok(subdir) = subdir_entry.file_name().into_string().unwrap_or_default().parse::<u32>() else {
                    continue;
                };
                for file_entry in std::fs::read_dir(subdir_entry.path())? {
                    let file_entry = file_entry?;
                    if let Ok(id) = file_entry.file_name().into_string().unwrap_or_default().parse::<u64>() {
                        on_disk.insert(TrunkId { subdir, id });
                    }
                }
            }
        }
        let registered_set: HashSet<_> = registered.into_iter().collect();
        let orphaned: Vec<TrunkId> = on_disk.difference(&registered_set).copied().collect();
        let missing: Vec<TrunkId> = registered_set.difference(&on_disk).copied().collect();
        Ok(VerifyReport { orphaned, missing })
    }
}

/// Result of cross-checking the registry against the on-disk trunk files.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub orphaned: Vec<TrunkId>,
    pub missing: Vec<TrunkId>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_delete_roundtrip_persists() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("store_path.index");
        let registry = TrunkIdRegistry::load_on_start(&index_path).unwrap();
        let trunk = TrunkId { subdir: 0, id: 1 };
        registry.add(0, trunk).unwrap();
        assert!(registry.contains(0, trunk));

        let reopened = TrunkIdRegistry::load_on_start(&index_path).unwrap();
        assert!(reopened.contains(0, trunk));

        reopened.delete(0, trunk).unwrap();
        assert!(!reopened.contains(0, trunk));

        let reopened_again = TrunkIdRegistry::load_on_start(&index_path).unwrap();
        assert!(!reopened_again.contains(0, trunk));
    }

    #[test]
    fn verify_detects_orphaned_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("store_path.index");
        let store_path = dir.path().join("store0");
        std::fs::create_dir_all(store_path.join("0")).unwrap();
        std::fs::write(store_path.join("0").join("5"), b"").unwrap();

        let registry = TrunkIdRegistry::load_on_start(&index_path).unwrap();
        registry.add(0, TrunkId { subdir: 0, id: 99 }).unwrap();

        let report = registry.verify_on_start(0, &store_path).unwrap();
        assert_eq!(report.orphaned, vec![TrunkId { subdir: 0, id: 5 }]);
        assert_eq!(report.missing, vec![TrunkId { subdir: 0, id: 99 }]);
        assert!(!report.is_clean());
    }
}
