//! Replication channel state machine and push-result ring between two cluster members.
//!
//! Grounded on `replication_common.c`'s per-peer channel array and
//! `rpc_result_ring`'s version-keyed ring buffer with overflow list.

use crate::error::{Result, StorageError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of channels kept open between any two cluster members
/// (`CHANNELS_BETWEEN_TWO_SERVERS` in the source).
pub const CHANNELS_BETWEEN_TWO_SERVERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStage {
    None,
    Inited,
    Connecting,
    WaitingJoinResp,
    Syncing,
}

/// Deterministic channel index assignment so both sides of a pair agree on
/// which of their `CHANNELS_BETWEEN_TWO_SERVERS` channels talk to which.
/// Mirrors `set_server_link_index_for_replication`'s self-excluded position
/// in the local server array, combined with `(min_id, max_id)` so the two
/// sides' independently computed indices collide on the wire.
pub fn pair_base_offset(local_id: u32, peer_id: u32) -> usize {
    let (min_id, max_id) = if local_id < peer_id {
        (local_id, peer_id)
    } else {
        (peer_id, local_id)
    };
    ((min_id as usize) << 16) ^ (max_id as usize)
}

pub fn is_client(local_id: u32, peer_id: u32) -> bool {
    local_id < peer_id
}

/// One in-flight ack-tracking entry: the producer-assigned version and the
/// originating write's wake-up handle.
pub struct PushResultEntry {
    pub data_version: u64,
    pub submitted_at: Instant,
    pub notify: Box<dyn FnOnce(Result<()>) + Send>,
}

/// Version-keyed ring buffer of in-flight push results, with a linked-list
/// overflow for the rare bursty case the ring can't hold between two cluster members.
pub struct PushResultRing {
    ring: Vec<Option<PushResultEntry>>,
    base_version: u64,
    overflow: VecDeque<PushResultEntry>,
    expires: Duration,
}

impl PushResultRing {
    pub fn new(capacity: usize, expires: Duration) -> Self {
        PushResultRing {
            ring: (0..capacity.max(1)).map(|_| None).collect(),
            base_version: 0,
            overflow: VecDeque::new(),
            expires,
        }
    }

    pub fn push(&mut self, entry: PushResultEntry) {
        let capacity = self.ring.len() as u64;
        if entry.data_version >= self.base_version && entry.data_version < self.base_version + capacity {
            let slot = (entry.data_version % capacity) as usize;
            self.ring[slot] = Some(entry);
        } else {
            self.overflow.push_back(entry);
        }
    }

    /// Matches every entry with `data_version <= acked` and notifies it,
    /// advancing `base_version` past them ("match entries ...
    /// notify the waiting task").
    pub fn ack(&mut self, acked: u64, err_no: Result<()>) {
        let capacity = self.ring.len() as u64;
        while self.base_version <= acked {
            let slot = (self.base_version % capacity) as usize;
            if let Some(entry) = self.ring[slot].take() {
                (entry.notify)(match &err_no {
                    Ok(()) => Ok(()),
                    Err(e) => Err(clone_err(e)),
                });
            }
            self.base_version += 1;
        }
        let mut remaining = VecDeque::new();
        while let Some(entry) = self.overflow.pop_front() {
            if entry.data_version <= acked {
                (entry.notify)(match &err_no {
                    Ok(()) => Ok(()),
                    Err(e) => Err(clone_err(e)),
                });
            } else {
                remaining.push_back(entry);
            }
        }
        self.overflow = remaining;
    }

    /// Pops every expired entry (ring and overflow) and notifies them with
    /// `TIMEOUT`, push-result entries expire via `expires`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for slot in self.ring.iter_mut() {
            if let Some(entry) = slot {
                if now.duration_since(entry.submitted_at) > self.expires {
                    let entry = slot.take().unwrap();
                    (entry.notify)(Err(StorageError::Timeout));
                    expired += 1;
                }
            }
        }
        let expires = self.expires;
        let mut remaining = VecDeque::new();
        while let Some(entry) = self.overflow.pop_front() {
            if now.duration_since(entry.submitted_at) > expires {
                (entry.notify)(Err(StorageError::Timeout));
                expired += 1;
            } else {
                remaining.push_back(entry);
            }
        }
        self.overflow = remaining;
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.ring.iter().all(Option::is_none) && self.overflow.is_empty()
    }
}

fn clone_err(e: &StorageError) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Tracks `last_data_versions` so that
/// `by_resp <= by_disk.current <= by_queue`.
#[derive(Default)]
pub struct LastDataVersions {
    pub by_queue: AtomicU64,
    pub by_disk: AtomicU64,
    pub by_resp: AtomicU64,
}

impl LastDataVersions {
    pub fn record_queued(&self, version: u64) {
        self.by_queue.fetch_max(version, Ordering::AcqRel);
    }

    pub fn record_written(&self, version: u64) {
        self.by_disk.fetch_max(version, Ordering::AcqRel);
    }

    pub fn record_acked(&self, version: u64) {
        self.by_resp.fetch_max(version, Ordering::AcqRel);
    }

    pub fn invariant_holds(&self) -> bool {
        let resp = self.by_resp.load(Ordering::Acquire);
        let disk = self.by_disk.load(Ordering::Acquire);
        let queue = self.by_queue.load(Ordering::Acquire);
        resp <= disk && disk <= queue
    }
}

/// One replication channel's state machine and failure backoff.
pub struct ReplicationChannel {
    pub peer_id: u32,
    pub thread_index: usize,
    pub is_client: bool,
    stage: AtomicU32,
    fail_count: AtomicU32,
    next_connect_time: std::sync::Mutex<Option<Instant>>,
    pub last_data_versions: LastDataVersions,
}

fn stage_to_u32(stage: ChannelStage) -> u32 {
    match stage {
        ChannelStage::None => 0,
        ChannelStage::Inited => 1,
        ChannelStage::Connecting => 2,
        ChannelStage::WaitingJoinResp => 3,
        ChannelStage::Syncing => 4,
    }
}

fn u32_to_stage(v: u32) -> ChannelStage {
    match v {
        1 => ChannelStage::Inited,
        2 => ChannelStage::Connecting,
        3 => ChannelStage::WaitingJoinResp,
        4 => ChannelStage::Syncing,
        _ => ChannelStage::None,
    }
}

impl ReplicationChannel {
    pub fn new(peer_id: u32, thread_index: usize, is_client: bool) -> Self {
        ReplicationChannel {
            peer_id,
            thread_index,
            is_client,
            stage: AtomicU32::new(stage_to_u32(ChannelStage::None)),
            fail_count: AtomicU32::new(0),
            next_connect_time: std::sync::Mutex::new(None),
            last_data_versions: LastDataVersions::default(),
        }
    }

    pub fn stage(&self) -> ChannelStage {
        u32_to_stage(self.stage.load(Ordering::Acquire))
    }

    /// `NONE -> INITED`: exactly-once claim under the caller's global lock.
    /// Returns `false` (claim failed) if the channel wasn't idle.
    pub fn try_claim(&self) -> bool {
        self.stage
            .compare_exchange(
                stage_to_u32(ChannelStage::None),
                stage_to_u32(ChannelStage::Inited),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn advance(&self, to: ChannelStage) {
        self.stage.store(stage_to_u32(to), Ordering::Release);
    }

    /// Drives the channel back to `NONE` on socket error, timeout, or
    /// peer-rejected JOIN, scheduling the next connect attempt with
    /// exponential backoff capped at `max_backoff`.
    pub fn fail(&self, max_backoff: Duration) {
        self.stage.store(stage_to_u32(ChannelStage::None), Ordering::Release);
        let count = self.fail_count.fetch_add(1, Ordering::AcqRel) + 1;
        let backoff_ms = (100u64.saturating_mul(1 << count.min(10))).min(max_backoff.as_millis() as u64);
        *self.next_connect_time.lock().unwrap() = Some(Instant::now() + Duration::from_millis(backoff_ms));
    }

    pub fn reset_backoff(&self) {
        self.fail_count.store(0, Ordering::Release);
        *self.next_connect_time.lock().unwrap() = None;
    }

    pub fn can_reconnect_now(&self) -> bool {
        match *self.next_connect_time.lock().unwrap() {
            Some(t) => Instant::now() >= t,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn claim_is_exactly_once() {
        let channel = ReplicationChannel::new(2, 0, true);
        assert!(channel.try_claim());
        assert!(!channel.try_claim());
        assert_eq!(channel.stage(), ChannelStage::Inited);
    }

    #[test]
    fn fail_returns_to_none_and_sets_backoff() {
        let channel = ReplicationChannel::new(2, 0, true);
        channel.advance(ChannelStage::Syncing);
        channel.fail(Duration::from_secs(60));
        assert_eq!(channel.stage(), ChannelStage::None);
        assert!(!channel.can_reconnect_now());
    }

    #[test]
    fn pair_base_offset_is_symmetric() {
        assert_eq!(pair_base_offset(3, 9), pair_base_offset(9, 3));
        assert!(is_client(3, 9));
        assert!(!is_client(9, 3));
    }

    #[test]
    fn push_result_ring_acks_in_order_scenario_4() {
        let mut ring = PushResultRing::new(64, Duration::from_secs(30));
        let results: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
        for v in 1..=1000u64 {
            let results = results.clone();
            ring.push(PushResultEntry {
                data_version: v,
                submitted_at: Instant::now(),
                notify: Box::new(move |_| results.lock().unwrap().push(v)),
            });
            ring.ack(v, Ok(()));
        }
        assert_eq!(results.lock().unwrap().len(), 1000);
        assert!(ring.is_empty());
    }

    #[test]
    fn expired_entries_are_notified_with_timeout() {
        let mut ring = PushResultRing::new(4, Duration::from_millis(1));
        let fired = Arc::new(StdMutex::new(false));
        let fired2 = fired.clone();
        ring.push(PushResultEntry {
            data_version: 0,
            submitted_at: Instant::now() - Duration::from_secs(1),
            notify: Box::new(move |result| {
                *fired2.lock().unwrap() = matches!(result, Err(StorageError::Timeout));
            }),
        });
        let expired = ring.expire(Instant::now());
        assert_eq!(expired, 1);
        assert!(*fired.lock().unwrap());
    }
}
