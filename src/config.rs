//! `storage.conf` parsing into a typed [`SystemConfig`], replacing the
//! source's macro-heavy `STORAGE_CFG.object_block.shared_locks_count` style
//! access with named fields The file format is the ini-style layout
//! describes: a handful of top-level keys plus repeated `[store-path-N]` /
//! `[write-cache-path-N]` sections. No ini crate in the corpus covers this
//! domain-specific dialect (ratio suffixes, `HH:MM` windows, indexed
//! sections), so parsing is hand-rolled the way `storage_config.c` does it.

use crate::error::{Result, StorageError};
use std::collections::HashMap;
use std::path::Path;

const MIN_TRUNK_FILE_SIZE: u64 = 256 * 1024 * 1024;
const MAX_TRUNK_FILE_SIZE: u64 = 16 * 1024 * 1024 * 1024;
const MIN_DISCARD_REMAIN: u32 = 256;
const MAX_DISCARD_REMAIN: u32 = 256 * 1024;

/// A parsed `HH:MM` time-of-day, used by the write-cache flush window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    fn parse(s: &str) -> Result<Self> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| StorageError::InvalidConfig(format!("not a HH:MM time: {s}")))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| StorageError::InvalidConfig(format!("bad hour in: {s}")))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| StorageError::InvalidConfig(format!("bad minute in: {s}")))?;
        if hour > 23 || minute > 59 {
            return Err(StorageError::InvalidConfig(format!("time out of range: {s}")));
        }
        Ok(TimeOfDay { hour, minute })
    }
}

/// One `[store-path-N]` / `[write-cache-path-N]` section.
#[derive(Debug, Clone)]
pub struct PathConfig {
    pub index: u32,
    pub path: std::path::PathBuf,
    pub write_threads: u32,
    pub read_threads: u32,
    pub prealloc_trunks: u32,
    pub reserved_space_ratio: f64,
}

/// Write-cache-to-disk flush window.
#[derive(Debug, Clone, Copy)]
pub struct WriteCacheFlushWindow {
    pub on_usage_ratio: f64,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

/// Fully typed view of `storage.conf`.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub write_threads_per_disk: u32,
    pub read_threads_per_disk: u32,
    pub fd_cache_capacity_per_read_thread: u32,
    pub object_block_hashtable_capacity: u64,
    pub object_block_shared_locks_count: u32,
    pub prealloc_trunks_per_writer: u32,
    pub prealloc_trunk_threads: u32,
    pub max_trunk_files_per_subdir: u32,
    pub trunk_file_size: u64,
    pub discard_remain_space_size: u32,
    pub reserved_space_per_disk_ratio: f64,
    pub reclaim_trunks_on_usage_ratio: f64,
    pub write_cache_to_hd: Option<WriteCacheFlushWindow>,
    pub store_paths: Vec<PathConfig>,
    pub write_cache_paths: Vec<PathConfig>,
    pub data_thread_count: u32,
    pub network_timeout_secs: u64,
    pub push_result_ring_capacity: usize,
    pub push_result_expires_secs: u64,
    pub data_path: std::path::PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            write_threads_per_disk: 1,
            read_threads_per_disk: 1,
            fd_cache_capacity_per_read_thread: 256,
            object_block_hashtable_capacity: 1_403_641,
            object_block_shared_locks_count: 163,
            prealloc_trunks_per_writer: 2,
            prealloc_trunk_threads: 1,
            max_trunk_files_per_subdir: 100,
            trunk_file_size: 1024 * 1024 * 1024,
            discard_remain_space_size: 4 * 1024,
            reserved_space_per_disk_ratio: 0.10,
            reclaim_trunks_on_usage_ratio: 0.50,
            write_cache_to_hd: None,
            store_paths: Vec::new(),
            write_cache_paths: Vec::new(),
            data_thread_count: 4,
            network_timeout_secs: 30,
            push_result_ring_capacity: 4096,
            push_result_expires_secs: 60,
            data_path: std::path::PathBuf::from("."),
        }
    }
}

impl SystemConfig {
    /// `active_test_interval = round(network_timeout / 2)` .
    pub fn active_test_interval_secs(&self) -> u64 {
        (self.network_timeout_secs + 1) / 2
    }
}

impl SystemConfig {
    /// Loads and validates `storage.conf` at `path`. Mirrors
    /// `storage_config_load` in spirit: every clamp and ratio check is a
    /// fatal `INVALID_CONFIG` at startup, never a silent fallback for a
    /// value the operator explicitly set.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let doc = IniDocument::parse(text);
        let mut cfg = SystemConfig::default();

        if let Some(v) = doc.get_global("write_threads_per_disk") {
            cfg.write_threads_per_disk = parse_positive_u32(v, "write_threads_per_disk")?;
        }
        if let Some(v) = doc.get_global("read_threads_per_disk") {
            cfg.read_threads_per_disk = parse_positive_u32(v, "read_threads_per_disk")?;
        }
        if let Some(v) = doc.get_global("fd_cache_capacity_per_read_thread") {
            cfg.fd_cache_capacity_per_read_thread = parse_positive_u32(v, "fd_cache_capacity_per_read_thread")?;
        }
        if let Some(v) = doc.get_global("object_block_hashtable_capacity") {
            cfg.object_block_hashtable_capacity = v
                .parse()
                .map_err(|_| StorageError::InvalidConfig("object_block_hashtable_capacity".into()))?;
        }
        if let Some(v) = doc.get_global("object_block_shared_locks_count") {
            cfg.object_block_shared_locks_count = parse_positive_u32(v, "object_block_shared_locks_count")?;
        }
        if let Some(v) = doc.get_global("prealloc_trunks_per_writer") {
            cfg.prealloc_trunks_per_writer = parse_positive_u32(v, "prealloc_trunks_per_writer")?;
        }
        if let Some(v) = doc.get_global("prealloc_trunk_threads") {
            cfg.prealloc_trunk_threads = parse_positive_u32(v, "prealloc_trunk_threads")?;
        }
        if let Some(v) = doc.get_global("max_trunk_files_per_subdir") {
            cfg.max_trunk_files_per_subdir = parse_positive_u32(v, "max_trunk_files_per_subdir")?;
        }
        if let Some(v) = doc.get_global("trunk_file_size") {
            let bytes = parse_bytes(v, "trunk_file_size")?;
            cfg.trunk_file_size = bytes.clamp(MIN_TRUNK_FILE_SIZE, MAX_TRUNK_FILE_SIZE);
        }
        if let Some(v) = doc.get_global("discard_remain_space_size") {
            let bytes = parse_bytes(v, "discard_remain_space_size")? as u32;
            cfg.discard_remain_space_size = bytes.clamp(MIN_DISCARD_REMAIN, MAX_DISCARD_REMAIN);
        }
        if let Some(v) = doc.get_global("reserved_space_per_disk") {
            cfg.reserved_space_per_disk_ratio = parse_ratio(v, "reserved_space_per_disk")?;
        }
        if let Some(v) = doc.get_global("reclaim_trunks_on_usage") {
            cfg.reclaim_trunks_on_usage_ratio = parse_ratio(v, "reclaim_trunks_on_usage")?;
        }
        if let Some(v) = doc.get_global("data_thread_count") {
            cfg.data_thread_count = parse_positive_u32(v, "data_thread_count")?;
        }
        if let Some(v) = doc.get_global("network_timeout") {
            cfg.network_timeout_secs = v
                .parse()
                .map_err(|_| StorageError::InvalidConfig("network_timeout".into()))?;
        }
        if let Some(v) = doc.get_global("push_result_ring_capacity") {
            cfg.push_result_ring_capacity = parse_positive_u32(v, "push_result_ring_capacity")? as usize;
        }
        if let Some(v) = doc.get_global("data_path") {
            cfg.data_path = std::path::PathBuf::from(v);
        }
        if let Some(v) = doc.get_global("push_result_expires") {
            cfg.push_result_expires_secs = v
                .parse()
                .map_err(|_| StorageError::InvalidConfig("push_result_expires".into()))?;
        }

        let on_usage = doc.get_global("write_cache_to_hd_on_usage");
        let start = doc.get_global("write_cache_to_hd_start_time");
        let end = doc.get_global("write_cache_to_hd_end_time");
        if let (Some(on_usage), Some(start), Some(end)) = (on_usage, start, end) {
            cfg.write_cache_to_hd = Some(WriteCacheFlushWindow {
                on_usage_ratio: parse_ratio(on_usage, "write_cache_to_hd_on_usage")?,
                start: TimeOfDay::parse(start)?,
                end: TimeOfDay::parse(end)?,
            });
        }

        for (section_name, section) in doc.sections_with_prefix("store-path-") {
            cfg.store_paths.push(parse_path_section(section_name, section)?);
        }
        for (section_name, section) in doc.sections_with_prefix("write-cache-path-") {
            cfg.write_cache_paths.push(parse_path_section(section_name, section)?);
        }
        cfg.store_paths.sort_by_key(|p| p.index);
        cfg.write_cache_paths.sort_by_key(|p| p.index);

        if cfg.store_paths.is_empty() {
            return Err(StorageError::InvalidConfig(
                "at least one [store-path-N] section is required".into(),
            ));
        }

        Ok(cfg)
    }
}

fn parse_path_section(name: &str, section: &HashMap<String, String>) -> Result<PathConfig> {
    let index: u32 = name
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StorageError::InvalidConfig(format!("bad path section name: {name}")))?;
    let path = section
        .get("path")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StorageError::InvalidConfig(format!("section {name}: missing path")))?;
    Ok(PathConfig {
        index,
        path: std::path::PathBuf::from(path),
        write_threads: section
            .get("write_threads")
            .map(|v| parse_positive_u32(v, "write_threads"))
            .transpose()?
            .unwrap_or(1),
        read_threads: section
            .get("read_threads")
            .map(|v| parse_positive_u32(v, "read_threads"))
            .transpose()?
            .unwrap_or(1),
        prealloc_trunks: section
            .get("prealloc_trunks")
            .map(|v| parse_positive_u32(v, "prealloc_trunks"))
            .transpose()?
            .unwrap_or(2),
        reserved_space_ratio: section
            .get("reserved_space")
            .map(|v| parse_ratio(v, "reserved_space"))
            .transpose()?
            .unwrap_or(0.10),
    })
}

fn parse_positive_u32(v: &str, field: &str) -> Result<u32> {
    let n: u32 = v
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("{field}: not an integer: {v}")))?;
    if n == 0 {
        return Err(StorageError::InvalidConfig(format!("{field}: must be >= 1")));
    }
    Ok(n)
}

/// Parses a byte-count with an optional `K`/`M`/`G` suffix.
fn parse_bytes(v: &str, field: &str) -> Result<u64> {
    let v = v.trim();
    let (digits, mult) = match v.chars().last() {
        Some('K') | Some('k') => (&v[..v.len() - 1], 1024u64),
        Some('M') | Some('m') => (&v[..v.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&v[..v.len() - 1], 1024 * 1024 * 1024),
        _ => (v, 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("{field}: not a byte size: {v}")))?;
    Ok(n * mult)
}

/// Parses a `"NN%"` ratio into `[0.0, 1.0]`, matching `ini_get_ratio_value`.
fn parse_ratio(v: &str, field: &str) -> Result<f64> {
    let v = v.trim();
    let stripped = v
        .strip_suffix('%')
        .ok_or_else(|| StorageError::InvalidConfig(format!("{field}: expected a %-suffixed ratio: {v}")))?;
    let d: f64 = stripped
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("{field}: not a ratio: {v}")))?;
    if !(0.00001..=100.00001).contains(&d) {
        return Err(StorageError::InvalidConfig(format!("{field}: ratio out of range: {v}")));
    }
    Ok(d / 100.0)
}

/// Minimal ini-style document: unnamed leading keys plus named `[section]`
/// blocks, each a flat `key = value` map. Comments start with `#` or `;`.
struct IniDocument {
    global: HashMap<String, String>,
    sections: Vec<(String, HashMap<String, String>)>,
}

impl IniDocument {
    fn parse(text: &str) -> Self {
        let mut global = HashMap::new();
        let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();
        let mut current: Option<HashMap<String, String>> = None;
        let mut current_name = String::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if let Some(map) = current.take() {
                    sections.push((current_name.clone(), map));
                }
                current_name = section.trim().to_string();
                current = Some(HashMap::new());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            match &mut current {
                Some(map) => {
                    map.insert(key, value);
                }
                None => {
                    global.insert(key, value);
                }
            }
        }
        if let Some(map) = current.take() {
            sections.push((current_name, map));
        }

        IniDocument { global, sections }
    }

    fn get_global(&self, key: &str) -> Option<&str> {
        self.global.get(key).map(|s| s.as_str())
    }

    fn sections_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a HashMap<String, String>)> {
        self.sections
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
            .map(|(name, map)| (name.as_str(), map))
    }
}
