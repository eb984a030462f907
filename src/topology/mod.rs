//! Cluster-topology notifier for one storage server. Grounded on `cluster_topology.c`'s
//! per-peer push context: a pre-sized `events` array plus an MPSC queue,
//! with CAS on each event's `in_queue` flag giving at-most-once delivery.

pub mod server_group;

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub use server_group::ServerGroupInfo;

/// One `(data_group, server)` slot's pending-notification state.
pub struct NotifyEvent {
    pub data_group_id: u32,
    pub server_id: u32,
    in_queue: AtomicBool,
    status: AtomicU32,
}

impl NotifyEvent {
    fn new(data_group_id: u32, server_id: u32) -> Self {
        NotifyEvent {
            data_group_id,
            server_id,
            in_queue: AtomicBool::new(false),
            status: AtomicU32::new(0),
        }
    }

    /// CAS `in_queue` 0->1. `true` means the caller must enqueue this event;
    /// `false` means a change is already pending delivery.
    fn claim(&self) -> bool {
        self.in_queue
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the claim so a fresh status change can be enqueued again.
    /// Must happen strictly before the batched frame is sent.
    fn release(&self) {
        self.in_queue.store(false, Ordering::Release);
    }
}

/// Pre-sized `data_groups x servers` event table for one peer, plus the MPSC
/// queue the peer's I/O task drains.
pub struct PeerPushContext {
    pub peer_id: u32,
    events: Vec<Arc<NotifyEvent>>,
    data_group_count: u32,
    tx: Sender<Arc<NotifyEvent>>,
    rx: Receiver<Arc<NotifyEvent>>,
}

impl PeerPushContext {
    pub fn new(peer_id: u32, data_group_count: u32, server_ids: &[u32]) -> Self {
        let mut events = Vec::with_capacity((data_group_count as usize) * server_ids.len());
        for &server_id in server_ids {
            for data_group_id in 0..data_group_count {
                events.push(Arc::new(NotifyEvent::new(data_group_id, server_id)));
            }
        }
        let (tx, rx) = unbounded();
        PeerPushContext {
            peer_id,
            events,
            data_group_count,
            tx,
            rx,
        }
    }

    fn slot(&self, data_group_id: u32, server_id: u32, server_ids_index: usize) -> &Arc<NotifyEvent> {
        &self.events[server_ids_index * self.data_group_count as usize + data_group_id as usize]
    }

    /// Called by the status-change handler for every active, non-self peer.
    /// Enqueues at most once per outstanding change.
    pub fn notify(&self, server_ids_index: usize, data_group_id: u32, server_id: u32, new_status: u32) {
        let event = self.slot(data_group_id, server_id, server_ids_index);
        event.status.store(new_status, Ordering::Release);
        if event.claim() {
            let _ = self.tx.send(event.clone());
        }
    }

    /// Drains the queue in one pass, building the batched
    /// `PUSH_DATA_SERVER_STATUS` body parts and releasing each event's
    /// `in_queue` flag before the caller sends the frame.
    pub fn drain_batch(&self) -> Vec<DataServerStatusPart> {
        let mut parts = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            let status = event.status.load(Ordering::Acquire);
            event.release();
            parts.push(DataServerStatusPart {
                data_group_id: event.data_group_id,
                server_id: event.server_id,
                status,
            });
        }
        parts
    }

    pub fn pending_count(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataServerStatusPart {
    pub data_group_id: u32,
    pub server_id: u32,
    pub status: u32,
}

/// Owns one `PeerPushContext` per active, non-self cluster member.
pub struct TopologyNotifier {
    peers: Vec<PeerPushContext>,
}

impl TopologyNotifier {
    pub fn new(local_id: u32, peer_ids: &[u32], data_group_count: u32, server_ids: &[u32]) -> Self {
        let peers = peer_ids
            .iter()
            .filter(|&&id| id != local_id)
            .map(|&peer_id| PeerPushContext::new(peer_id, data_group_count, server_ids))
            .collect();
        TopologyNotifier { peers }
    }

    /// Walks every active, non-self peer and enqueues the status change for
    /// each.
    pub fn broadcast_status_change(&self, server_ids_index: usize, data_group_id: u32, server_id: u32, new_status: u32) {
        for peer in &self.peers {
            peer.notify(server_ids_index, data_group_id, server_id, new_status);
        }
    }

    pub fn peer(&self, peer_id: u32) -> Option<&PeerPushContext> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn peers(&self) -> &[PeerPushContext] {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn duplicate_notify_before_drain_coalesces_into_one_event() {
        let ctx = PeerPushContext::new(2, 4, &[1]);
        ctx.notify(0, 1, 1, 1);
        ctx.notify(0, 1, 1, 2);
        assert_eq!(ctx.pending_count(), 1);
        let batch = ctx.drain_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, 2);
    }

    #[test]
    fn status_change_after_drain_is_not_missed() {
        let ctx = PeerPushContext::new(2, 4, &[1]);
        ctx.notify(0, 1, 1, 1);
        let first_batch = ctx.drain_batch();
        assert_eq!(first_batch.len(), 1);

        ctx.notify(0, 1, 1, 3);
        let second_batch = ctx.drain_batch();
        assert_eq!(second_batch.len(), 1);
        assert_eq!(second_batch[0].status, 3);
    }

    #[test]
    fn broadcast_reaches_every_non_self_peer() {
        let notifier = TopologyNotifier::new(5, &[1, 5, 9], 2, &[1, 9]);
        notifier.broadcast_status_change(0, 0, 1, 7);
        assert_eq!(notifier.peer(1).unwrap().drain_batch().len(), 1);
        assert_eq!(notifier.peer(9).unwrap().drain_batch().len(), 1);
    }

    #[test]
    fn concurrent_notifies_never_duplicate_an_event_in_flight() {
        let ctx = Arc::new(PeerPushContext::new(2, 1, &[1]));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                ctx.notify(0, 0, 1, 9);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ctx.pending_count(), 1);
    }
}
