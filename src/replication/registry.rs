//! Global replication channel array: owns every channel, across every peer,
//! and serves the exactly-once idle claim (
//! `fs_get_idle_replication_by_peer`).

use crate::replication::channel::{is_client, ReplicationChannel, CHANNELS_BETWEEN_TWO_SERVERS};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct ReplicationRegistry {
    // Guards only the claim operation; channel internals use their own
    // atomics (one global mutex guards only the idle-claim operation).
    claim_lock: Mutex<()>,
    channels: Vec<Arc<ReplicationChannel>>,
}

impl ReplicationRegistry {
    /// Builds the full channel set for `local_id` against every other
    /// member of `peer_ids` (self excluded automatically if present).
    pub fn new(local_id: u32, peer_ids: &[u32]) -> Self {
        let mut channels = Vec::new();
        for &peer_id in peer_ids {
            if peer_id == local_id {
                continue;
            }
            let client = is_client(local_id, peer_id);
            for i in 0..CHANNELS_BETWEEN_TWO_SERVERS {
                channels.push(Arc::new(ReplicationChannel::new(peer_id, i, client)));
            }
        }
        ReplicationRegistry {
            claim_lock: Mutex::new(()),
            channels,
        }
    }

    pub fn channels_for_peer(&self, peer_id: u32) -> impl Iterator<Item = &Arc<ReplicationChannel>> {
        self.channels.iter().filter(move |c| c.peer_id == peer_id)
    }

    pub fn all_channels(&self) -> &[Arc<ReplicationChannel>] {
        &self.channels
    }

    /// Exactly-once claim of an idle (`NONE`-stage) channel to `peer_id`.
    pub fn claim_idle_for_peer(&self, peer_id: u32) -> Option<Arc<ReplicationChannel>> {
        let _guard = self.claim_lock.lock();
        self.channels
            .iter()
            .find(|c| c.peer_id == peer_id && c.try_claim())
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_channels_for_every_other_peer_excluding_self() {
        let registry = ReplicationRegistry::new(5, &[1, 5, 9]);
        assert_eq!(registry.count(), 2 * CHANNELS_BETWEEN_TWO_SERVERS);
    }

    #[test]
    fn claim_idle_is_exactly_once_per_channel() {
        let registry = ReplicationRegistry::new(5, &[1, 5]);
        let first = registry.claim_idle_for_peer(1).unwrap();
        let second = registry.claim_idle_for_peer(1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(registry.claim_idle_for_peer(1).is_none());
    }
}
