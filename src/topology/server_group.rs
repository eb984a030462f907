//! `server_group.info` : ini-style, one `[server-<id>]` section per
//! cluster member with a `status=<int>` key. This is the durable record of
//! server status the topology notifier's `PUSH_DATA_SERVER_STATUS` frames
//! exist to propagate; loading it is how a restarting server learns where
//! every peer stood before it went down.

use crate::error::{Result, StorageError};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerGroupInfo {
    status_by_server: BTreeMap<u32, i32>,
}

impl ServerGroupInfo {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(ServerGroupInfo::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut status_by_server = BTreeMap::new();
        let mut current_id: Option<u32> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let id_str = section
                    .strip_prefix("server-")
                    .ok_or_else(|| StorageError::InvalidConfig(format!("bad server_group.info section: {section}")))?;
                current_id = Some(
                    id_str
                        .parse()
                        .map_err(|_| StorageError::InvalidConfig(format!("bad server id: {id_str}")))?,
                );
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() != "status" {
                continue;
            }
            let id = current_id.ok_or_else(|| StorageError::InvalidConfig("status line outside any [server-N] section".into()))?;
            let status: i32 = value
                .trim()
                .parse()
                .map_err(|_| StorageError::InvalidConfig(format!("bad status value: {value}")))?;
            status_by_server.insert(id, status);
        }

        Ok(ServerGroupInfo { status_by_server })
    }

    pub fn status(&self, server_id: u32) -> Option<i32> {
        self.status_by_server.get(&server_id).copied()
    }

    pub fn set_status(&mut self, server_id: u32, status: i32) {
        self.status_by_server.insert(server_id, status);
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for (id, status) in &self.status_by_server {
            text.push_str(&format!("[server-{id}]\nstatus={status}\n"));
        }
        let tmp_path = path.with_extension("info.tmp");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn server_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.status_by_server.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
[server-1]
status=1

[server-2]
status=0
";

    #[test]
    fn parses_per_server_status_sections() {
        let info = ServerGroupInfo::parse(SAMPLE).unwrap();
        assert_eq!(info.status(1), Some(1));
        assert_eq!(info.status(2), Some(0));
        assert_eq!(info.status(3), None);
    }

    #[test]
    fn persist_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_group.info");
        let mut info = ServerGroupInfo::default();
        info.set_status(1, 1);
        info.set_status(9, -1);
        info.persist(&path).unwrap();

        let reloaded = ServerGroupInfo::load(&path).unwrap();
        assert_eq!(reloaded, info);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let info = ServerGroupInfo::load(&dir.path().join("missing.info")).unwrap();
        assert!(info.status_by_server.is_empty());
    }

    #[test]
    fn rejects_status_line_outside_section() {
        assert!(ServerGroupInfo::parse("status=1\n").is_err());
    }
}
