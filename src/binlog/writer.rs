//! Binlog writer : append-only rotating file, draining a
//! multi-producer queue from one dedicated writer thread. Grounded on
//! `binlog_writer.h`'s `BinlogWriterInfo`/`BinlogWriterThread` split between
//! "what's on disk" state and "the thread that owns the queue".

use crate::binlog::record::Record;
use crate::error::{Result, StorageError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `FS_BINLOG_WRITER_TYPE_ORDER_BY_{NONE,VERSION}` in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    None,
    ByVersion { ring_size: usize },
}

struct FileState {
    index: u32,
    file: BufWriter<File>,
    size: u64,
}

impl FileState {
    fn open(subdir: &Path, index: u32) -> Result<Self> {
        let path = binlog_file_path(subdir, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(FileState {
            index,
            file: BufWriter::new(file),
            size,
        })
    }
}

pub fn binlog_file_path(subdir: &Path, index: u32) -> PathBuf {
    subdir.join(format!("binlog.{index:06}"))
}

/// Shared writer state the background thread owns exclusively; the handle
/// only ever touches it through the channel.
struct WriterThread {
    subdir: PathBuf,
    max_file_size: u64,
    order_mode: OrderMode,
    file: FileState,
    next_version: u64,
    ring: Vec<Option<Record>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl WriterThread {
    fn run(mut self, rx: Receiver<Record>) {
        while let Ok(record) = rx.recv() {
            match self.order_mode {
                OrderMode::None => {
                    if let Err(e) = self.write_record(&record) {
                        log::error!("binlog append failed: {e}");
                    }
                }
                OrderMode::ByVersion { ring_size } => {
                    if let Err(e) = self.handle_versioned(record, ring_size) {
                        log::error!("binlog versioned append failed: {e}");
                        // A version outside the admission window is a fatal
                        // contract violation, not a transient write failure:
                        // stop the thread and let subsequent submitters learn
                        // about it instead of silently dropping records.
                        *self.fatal.lock() = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        self.file.file.flush().ok();
    }

    fn handle_versioned(&mut self, record: Record, ring_size: usize) -> Result<()> {
        if record.version < self.next_version {
            // Already durable; producer resent after a partial ack, drop.
            return Ok(());
        }
        if record.version >= self.next_version + ring_size as u64 {
            return Err(crate::error::StorageError::ProtocolViolation(format!(
                "version {} exceeds admission window [{}, {})",
                record.version,
                self.next_version,
                self.next_version + ring_size as u64
            )));
        }
        if record.version == self.next_version {
            self.write_record(&record)?;
            self.next_version += 1;
            self.drain_contiguous(ring_size)?;
        } else {
            let slot = (record.version as usize) % ring_size;
            self.ring[slot] = Some(record);
        }
        Ok(())
    }

    fn drain_contiguous(&mut self, ring_size: usize) -> Result<()> {
        loop {
            let slot = (self.next_version as usize) % ring_size;
            let Some(record) = self.ring[slot].take() else {
                break;
            };
            self.write_record(&record)?;
            self.next_version += 1;
        }
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        let framed = record.encode();
        if self.file.size + framed.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        self.file.file.write_all(&framed)?;
        self.file.file.flush()?;
        self.file.size += framed.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.file.file.flush()?;
        let next_index = self.file.index + 1;
        self.file = FileState::open(&self.subdir, next_index)?;
        Ok(())
    }
}

/// Producer-facing handle: submits records onto the writer's queue. Cheap to
/// clone; every clone shares the same underlying channel and thread.
#[derive(Clone)]
pub struct BinlogWriter {
    tx: Sender<Record>,
    subdir: PathBuf,
    fatal: Arc<Mutex<Option<String>>>,
}

impl BinlogWriter {
    /// Starts a writer in order-by-none mode .
    pub fn start_normal(subdir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        Self::start(subdir, max_file_size, OrderMode::None, 0)
    }

    /// Starts a writer in order-by-version mode with the given ring size and
    /// the first version it should expect to see.
    pub fn start_by_version(
        subdir: impl Into<PathBuf>,
        max_file_size: u64,
        ring_size: usize,
        next_version: u64,
    ) -> Result<Self> {
        Self::start(subdir, max_file_size, OrderMode::ByVersion { ring_size }, next_version)
    }

    fn start(subdir: impl Into<PathBuf>, max_file_size: u64, order_mode: OrderMode, next_version: u64) -> Result<Self> {
        let subdir = subdir.into();
        std::fs::create_dir_all(&subdir)?;
        let index = highest_existing_index(&subdir)?.unwrap_or(0);
        let file = FileState::open(&subdir, index)?;
        let ring_size = match order_mode {
            OrderMode::ByVersion { ring_size } => ring_size,
            OrderMode::None => 0,
        };

        let (tx, rx) = unbounded();
        let fatal = Arc::new(Mutex::new(None));
        let thread = WriterThread {
            subdir: subdir.clone(),
            max_file_size,
            order_mode,
            file,
            next_version,
            ring: vec![None; ring_size.max(1)],
            fatal: fatal.clone(),
        };
        std::thread::spawn(move || thread.run(rx));

        Ok(BinlogWriter { tx, subdir, fatal })
    }

    pub fn submit(&self, record: Record) -> Result<()> {
        if let Some(msg) = self.fatal.lock().clone() {
            return Err(StorageError::ProtocolViolation(msg));
        }
        self.tx
            .send(record)
            .map_err(|_| StorageError::Busy("binlog writer thread gone"))
    }

    /// The fatal contract violation (if any) that stopped the writer
    /// thread, surfaced for callers that want to inspect it directly rather
    /// than wait for the next `submit` to fail.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn subdir(&self) -> &Path {
        &self.subdir
    }

    /// Blocks until every record submitted so far has been written, by
    /// sending a sentinel `NoOp` and waiting for the queue to drain past it.
    /// Used by tests and graceful shutdown.
    pub fn flush_sync(&self) {
        // crossbeam channels have no "flush" primitive; submitting is
        // ordered, so once the channel is empty everything prior has been
        // processed (single consumer).
        while !self.tx.is_empty() {
            std::thread::yield_now();
        }
        // Give the consumer a moment to finish processing the last item it
        // already popped off the queue.
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

fn highest_existing_index(subdir: &Path) -> Result<Option<u32>> {
    if !subdir.exists() {
        return Ok(None);
    }
    let mut max_index = None;
    for entry in std::fs::read_dir(subdir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(suffix) = name.strip_prefix("binlog.") {
            if let Ok(index) = suffix.parse::<u32>() {
                max_index = Some(max_index.map_or(index, |m: u32| m.max(index)));
            }
        }
    }
    Ok(max_index)
}

/// Recovery scan : on startup, scans the highest-indexed binlog
/// file and truncates it back to the last well-formed record boundary,
/// discarding any trailing bytes a crash left mid-record.
pub fn recover(subdir: &Path) -> Result<RecoveryReport> {
    let Some(index) = highest_existing_index(subdir)? else {
        return Ok(RecoveryReport::default());
    };
    let path = binlog_file_path(subdir, index);
    let bytes = std::fs::read(&path)?;
    let mut cursor = &bytes[..];
    let mut good_len = 0usize;
    let mut records = 0u64;
    let mut last_version = None;

    loop {
        let before = cursor.len();
        match Record::decode_one(&mut cursor) {
            Ok(Some(record)) => {
                good_len += before - cursor.len();
                records += 1;
                last_version = Some(record.version);
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    if good_len < bytes.len() {
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(good_len as u64)?;
    }

    Ok(RecoveryReport {
        file_index: index,
        truncated_bytes: (bytes.len() - good_len) as u64,
        records_recovered: records,
        last_version,
    })
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub file_index: u32,
    pub truncated_bytes: u64,
    pub records_recovered: u64,
    pub last_version: Option<u64>,
}
