//! Replication pipeline : channel state machine, push-result
//! ring, wire protocol, and the master/follower processing loops that tie
//! them to the object-block index and binlog writer.

pub mod channel;
pub mod protocol;
pub mod registry;

pub use channel::{ChannelStage, LastDataVersions, PushResultEntry, PushResultRing, ReplicationChannel};
pub use protocol::{AckBody, Command, Frame, JoinRequest, PushBinlogBatch};
pub use registry::ReplicationRegistry;

use crate::binlog::{BinlogWriter, Op, Record};
use crate::error::{Result, StorageError};
use crate::index::ObjectBlockIndex;
use crate::model::{BlockKey, SliceSize, TrunkSpace};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One outbound record plus its ack callback, queued by the thread that
/// produced it (`ReplicationRPCEntry` in the source).
pub struct ReplicationRpcEntry {
    pub record: Record,
    pub notify: Box<dyn FnOnce(Result<()>) + Send>,
}

/// Master-side I/O task: drains a channel's `rpc_queue`, serialises records
/// into `PUSH_BINLOG` frames, hands them to a transport, and resolves the
/// push-result ring as acks come back.
///
/// The transport is injected rather than owning a raw socket: production
/// wires it to a TCP stream, tests wire it to an in-memory pair, so the
/// network stays an external collaborator rather than something this
/// module owns directly.
pub trait ChannelTransport: Send {
    fn send_frame(&mut self, frame: &Frame) -> Result<()>;
    fn recv_frame(&mut self, timeout: Duration) -> Result<Option<Frame>>;
}

pub struct MasterChannelTask {
    channel: Arc<ReplicationChannel>,
    rpc_rx: Receiver<ReplicationRpcEntry>,
    result_ring: PushResultRing,
    batch_size: usize,
}

impl MasterChannelTask {
    pub fn new(channel: Arc<ReplicationChannel>, rpc_rx: Receiver<ReplicationRpcEntry>, ring_capacity: usize, expires: Duration) -> Self {
        MasterChannelTask {
            channel,
            rpc_rx,
            result_ring: PushResultRing::new(ring_capacity, expires),
            batch_size: 64,
        }
    }

    /// Drains whatever is currently queued (up to `batch_size` entries),
    /// pushes them into the result ring, and sends one batched
    /// `PUSH_BINLOG` frame. Returns `Ok(0)` when there was nothing to send.
    pub fn pump(&mut self, transport: &mut dyn ChannelTransport) -> Result<usize> {
        let mut records = Vec::new();
        for entry in self.rpc_rx.try_iter().take(self.batch_size) {
            self.channel.last_data_versions.record_queued(entry.record.version);
            let data_version = entry.record.version;
            records.push(entry.record);
            self.result_ring.push(PushResultEntry {
                data_version,
                submitted_at: Instant::now(),
                notify: entry.notify,
            });
        }
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();
        let highest = records.iter().map(|r| r.version).max().expect("records checked non-empty above");
        let batch = PushBinlogBatch { records };
        let frame = Frame {
            cmd: Command::PushBinlog,
            status: 0,
            body: batch.encode(),
        };
        transport.send_frame(&frame)?;
        self.channel.last_data_versions.record_written(highest);
        Ok(count)
    }

    /// Applies one inbound `ACK` frame to the push-result ring.
    pub fn handle_ack(&mut self, frame: &Frame) -> Result<()> {
        let ack = AckBody::decode(&frame.body)?;
        let outcome = if ack.err_no == 0 { Ok(()) } else { Err(StorageError::PeerDisconnected(format!("peer returned err_no {}", ack.err_no))) };
        self.channel.last_data_versions.record_acked(ack.highest_contiguous_version);
        self.result_ring.ack(ack.highest_contiguous_version, outcome);
        Ok(())
    }

    /// Times out any push-result entries that have outlived `expires`.
    pub fn expire_stale(&mut self) -> usize {
        self.result_ring.expire(Instant::now())
    }

    pub fn channel(&self) -> &Arc<ReplicationChannel> {
        &self.channel
    }
}

/// Decodes a `PUSH_BINLOG` record's body into `(oid, offset, ssize,
/// trunk_space)` so the follower side can re-apply it to its own index.
/// The body layout mirrors the one `crate::binlog::record` uses for
/// `AddSlice`/`DeleteSlice` bodies (see `binlog::record` for the encoder).
fn decode_add_slice_body(body: &[u8]) -> Result<(BlockKey, SliceSize, TrunkSpace)> {
    bincode::deserialize(body).map_err(|e| StorageError::ProtocolViolation(format!("bad AddSlice body: {e}")))
}

fn decode_delete_slice_body(body: &[u8]) -> Result<(BlockKey, u32)> {
    bincode::deserialize(body).map_err(|e| StorageError::ProtocolViolation(format!("bad DeleteSlice body: {e}")))
}

/// Follower-side apply path: routes each received record to the data-thread
/// responsible for its data group (`data_group_id mod data_thread_count`),
/// applies it to the slice index, persists it to that thread's binlog, and
/// reports the new highest contiguous version for acking.
pub struct FollowerDataThread {
    pub thread_index: u32,
    index: Arc<ObjectBlockIndex>,
    binlog: BinlogWriter,
    highest_contiguous: u64,
    has_applied: bool,
}

impl FollowerDataThread {
    pub fn new(thread_index: u32, index: Arc<ObjectBlockIndex>, binlog: BinlogWriter) -> Self {
        FollowerDataThread {
            thread_index,
            index,
            binlog,
            highest_contiguous: 0,
            has_applied: false,
        }
    }

    pub fn owns_group(&self, data_group_id: u32, data_thread_count: u32) -> bool {
        data_group_id % data_thread_count == self.thread_index
    }

    /// Applies one record to the index and appends it to this thread's
    /// binlog, advancing `highest_contiguous` on success.
    ///
    /// A record at or below `highest_contiguous` has already been applied
    /// (a replay after reconnect, or a duplicate delivery) and is ignored
    /// rather than re-applied to the index and binlog. `highest_contiguous`
    /// only ever advances by exactly one, so a gap in incoming versions
    /// holds it back instead of letting it jump ahead of what's actually
    /// been applied contiguously.
    pub fn apply(&mut self, record: Record) -> Result<()> {
        if self.has_applied && record.version <= self.highest_contiguous {
            return Ok(());
        }
        match record.op {
            Op::AddSlice => {
                let (bkey, ssize, space) = decode_add_slice_body(&record.body)?;
                self.index.add_slice(bkey, ssize, space)?;
            }
            Op::DeleteSlice => {
                let (bkey, offset) = decode_delete_slice_body(&record.body)?;
                self.index.delete_slice(bkey, offset)?;
            }
            Op::DeleteBlock => {
                let bkey: BlockKey = bincode::deserialize(&record.body)
                    .map_err(|e| StorageError::ProtocolViolation(format!("bad DeleteBlock body: {e}")))?;
                self.index.delete_block(bkey)?;
            }
            Op::NoOp => {}
        }
        self.binlog.submit(record.clone())?;
        if !self.has_applied || record.version == self.highest_contiguous + 1 {
            self.highest_contiguous = record.version;
        }
        self.has_applied = true;
        Ok(())
    }

    pub fn highest_contiguous(&self) -> u64 {
        self.highest_contiguous
    }

    /// Builds the `ACK` frame to send back to the master for everything
    /// applied so far.
    pub fn ack_frame(&self) -> Frame {
        Frame {
            cmd: Command::Ack,
            status: 0,
            body: AckBody {
                highest_contiguous_version: self.highest_contiguous,
                err_no: 0,
            }
            .encode(),
        }
    }
}

/// Splits a batch of inbound records by data-group ownership so a dispatcher
/// can hand each sub-batch to the right `FollowerDataThread`.
pub fn route_by_data_group(records: Vec<Record>, data_group_id_of: impl Fn(&Record) -> u32, data_thread_count: u32) -> Vec<Vec<Record>> {
    let mut buckets: Vec<Vec<Record>> = (0..data_thread_count).map(|_| Vec::new()).collect();
    for record in records {
        let group = data_group_id_of(&record);
        let idx = (group % data_thread_count) as usize;
        buckets[idx].push(record);
    }
    buckets
}

/// Per-peer push context for a graceful shutdown: sends the supplemented
/// `SHUTDOWN` frame before closing, so the follower can distinguish a
/// planned close from `PEER_DISCONNECTED` and skip reconnect backoff.
pub fn send_shutdown(transport: &mut dyn ChannelTransport) -> Result<()> {
    transport.send_frame(&Frame {
        cmd: Command::Shutdown,
        status: 0,
        body: Vec::new(),
    })
}

/// An in-process channel pair used by tests in place of a real socket.
pub struct InMemoryTransport {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        (InMemoryTransport { tx: tx_a, rx: rx_b }, InMemoryTransport { tx: tx_b, rx: rx_a })
    }
}

impl ChannelTransport for InMemoryTransport {
    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut body = Vec::new();
        frame.write_to(&mut body)?;
        let resent = Frame::read_from(&mut &body[..])?;
        self.tx
            .send(resent)
            .map_err(|_| StorageError::PeerDisconnected("transport closed".into()))
    }

    fn recv_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(StorageError::PeerDisconnected("transport closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::model::TrunkId;
    use crate::trunk::allocator::TrunkAllocator;
    use crate::trunk::manager::StorageAllocatorManager;
    use std::sync::Mutex as StdMutex;

    fn follower() -> (FollowerDataThread, tempfile::TempDir) {
        let cfg = SystemConfig::default();
        let allocator = Arc::new(TrunkAllocator::new(0, &cfg));
        allocator.add_trunk(TrunkId { subdir: 0, id: 1 }, 1024 * 1024);
        let mgr = Arc::new(StorageAllocatorManager::new(vec![], vec![allocator], &cfg));
        let index = Arc::new(ObjectBlockIndex::new(&cfg, mgr));
        let dir = tempfile::tempdir().unwrap();
        let binlog = BinlogWriter::start_normal(dir.path(), 64 * 1024 * 1024).unwrap();
        (FollowerDataThread::new(0, index, binlog), dir)
    }

    fn add_slice_record(version: u64, bkey: BlockKey, ssize: SliceSize, space: TrunkSpace) -> Record {
        Record {
            version,
            timestamp: 0,
            op: Op::AddSlice,
            body: bincode::serialize(&(bkey, ssize, space)).unwrap(),
        }
    }

    #[test]
    fn follower_applies_add_slice_and_advances_highest_contiguous() {
        let (mut follower, _dir) = follower();
        let bkey = BlockKey::new(1, 0);
        let space = TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: 0,
            size: 100,
        };
        follower.apply(add_slice_record(1, bkey, SliceSize::new(0, 100), space)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);
        let ack = follower.ack_frame();
        let body = AckBody::decode(&ack.body).unwrap();
        assert_eq!(body.highest_contiguous_version, 1);
    }

    #[test]
    fn replayed_record_is_not_reapplied_scenario_5() {
        let (mut follower, _dir) = follower();
        let bkey = BlockKey::new(1, 0);
        let space = TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: 0,
            size: 100,
        };
        follower.apply(add_slice_record(1, bkey, SliceSize::new(0, 100), space)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);
        assert_eq!(follower.index.block_count(), 1);

        // A reconnect replays version 1 again; it must not be re-applied to
        // the index (which would error on the now-overlapping slice) nor
        // re-submitted to the binlog.
        follower.apply(add_slice_record(1, bkey, SliceSize::new(0, 100), space)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);

        // An even older duplicate is likewise ignored.
        follower.apply(add_slice_record(0, bkey, SliceSize::new(200, 50), space)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);
    }

    #[test]
    fn a_gap_in_incoming_versions_holds_back_highest_contiguous() {
        let (mut follower, _dir) = follower();
        let bkey = BlockKey::new(1, 0);
        let space = TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: 0,
            size: 100,
        };
        follower.apply(add_slice_record(1, bkey, SliceSize::new(0, 100), space)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);

        // version 3 arrives before version 2: it is applied (replication
        // already resequenced delivery order upstream) but does not move
        // highest_contiguous past the gap at version 2.
        let space2 = TrunkSpace {
            path_index: 0,
            trunk_id: TrunkId { subdir: 0, id: 1 },
            file_offset: 100,
            size: 100,
        };
        follower.apply(add_slice_record(3, bkey, SliceSize::new(100, 100), space2)).unwrap();
        assert_eq!(follower.highest_contiguous(), 1);
    }

    #[test]
    fn routes_records_by_data_group_modulo_thread_count() {
        let records: Vec<Record> = (0..8u64)
            .map(|v| Record {
                version: v,
                timestamp: 0,
                op: Op::NoOp,
                body: Vec::new(),
            })
            .collect();
        let buckets = route_by_data_group(records, |r| r.version as u32, 4);
        assert_eq!(buckets.len(), 4);
        for (thread_index, bucket) in buckets.iter().enumerate() {
            for record in bucket {
                assert_eq!(record.version as usize % 4, thread_index);
            }
        }
    }

    #[test]
    fn master_task_pumps_queue_and_resolves_on_ack_scenario_4() {
        let channel = Arc::new(ReplicationChannel::new(2, 0, true));
        let (rpc_tx, rpc_rx) = unbounded();
        let mut task = MasterChannelTask::new(channel, rpc_rx, 64, Duration::from_secs(30));
        let (mut master_transport, mut follower_transport) = InMemoryTransport::pair();

        let acked_versions: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
        for v in 1..=5u64 {
            let acked_versions = acked_versions.clone();
            rpc_tx
                .send(ReplicationRpcEntry {
                    record: Record {
                        version: v,
                        timestamp: 0,
                        op: Op::NoOp,
                        body: Vec::new(),
                    },
                    notify: Box::new(move |_| acked_versions.lock().unwrap().push(v)),
                })
                .unwrap();
        }

        let sent = task.pump(&mut master_transport).unwrap();
        assert_eq!(sent, 5);

        let frame = follower_transport.recv_frame(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(frame.cmd, Command::PushBinlog);
        let batch = PushBinlogBatch::decode(&frame.body).unwrap();
        assert_eq!(batch.records.len(), 5);

        let ack_frame = Frame {
            cmd: Command::Ack,
            status: 0,
            body: AckBody {
                highest_contiguous_version: 5,
                err_no: 0,
            }
            .encode(),
        };
        task.handle_ack(&ack_frame).unwrap();

        assert_eq!(*acked_versions.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(task.channel().last_data_versions.invariant_holds());
    }
}
