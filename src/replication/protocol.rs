//! Replication wire protocol : 8-byte header
//! `{cmd:u8, status:u8, body_len:u32, padding:u16}` plus commands used by
//! the core (`JOIN_SERVER`, `PUSH_BINLOG`, `ACK`,
//! `PUSH_DATA_SERVER_STATUS`), plus the `SHUTDOWN` frame a graceful close should be able to signal
//! so followers can tell a graceful close from `PEER_DISCONNECTED`.

use crate::binlog::Record;
use crate::error::{Result, StorageError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    JoinServer = 1,
    PushBinlog = 2,
    Ack = 3,
    PushDataServerStatus = 4,
    Shutdown = 5,
}

impl Command {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Command::JoinServer,
            2 => Command::PushBinlog,
            3 => Command::Ack,
            4 => Command::PushDataServerStatus,
            5 => Command::Shutdown,
            _ => return Err(StorageError::ProtocolViolation(format!("unknown command {v}"))),
        })
    }
}

pub struct Frame {
    pub cmd: Command,
    pub status: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.cmd as u8)?;
        w.write_u8(self.status)?;
        w.write_u32::<LittleEndian>(self.body.len() as u32)?;
        w.write_u16::<LittleEndian>(0)?; // padding
        w.write_all(&self.body)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let cmd = Command::from_u8(r.read_u8()?)?;
        let status = r.read_u8()?;
        let body_len = r.read_u32::<LittleEndian>()?;
        let _padding = r.read_u16::<LittleEndian>()?;
        let mut body = vec![0u8; body_len as usize];
        r.read_exact(&mut body)?;
        Ok(Frame { cmd, status, body })
    }
}

/// `JOIN_SERVER` request body: which server/channel is joining and the
/// highest version it already has, so the master knows where to resume
/// streaming from.
pub struct JoinRequest {
    pub server_id: u32,
    pub channel_index: u32,
    pub last_known_data_version: u64,
}

impl JoinRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.write_u32::<LittleEndian>(self.server_id).unwrap();
        body.write_u32::<LittleEndian>(self.channel_index).unwrap();
        body.write_u64::<LittleEndian>(self.last_known_data_version).unwrap();
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cursor = body;
        Ok(JoinRequest {
            server_id: cursor.read_u32::<LittleEndian>()?,
            channel_index: cursor.read_u32::<LittleEndian>()?,
            last_known_data_version: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// `PUSH_BINLOG` body: one or more binlog records batched together.
pub struct PushBinlogBatch {
    pub records: Vec<Record>,
}

impl PushBinlogBatch {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(self.records.len() as u32).unwrap();
        for record in &self.records {
            let framed = record.encode();
            body.write_u32::<LittleEndian>(framed.len() as u32).unwrap();
            body.extend_from_slice(&framed);
        }
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cursor = body;
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            if cursor.len() < len {
                return Err(StorageError::ProtocolViolation("push_binlog body truncated".into()));
            }
            let (chunk, rest) = cursor.split_at(len);
            let mut chunk_reader = chunk;
            let record = crate::binlog::Record::decode_one(&mut chunk_reader)?
                .ok_or_else(|| StorageError::ProtocolViolation("push_binlog record frame empty".into()))?;
            records.push(record);
            cursor = rest;
        }
        Ok(PushBinlogBatch { records })
    }
}

/// `ACK` body: highest contiguous version applied by the follower, plus an
/// optional error code for `PEER_DISCONNECTED`/`PROTOCOL_VIOLATION` style
/// rejections.
pub struct AckBody {
    pub highest_contiguous_version: u64,
    pub err_no: u32,
}

impl AckBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(12);
        body.write_u64::<LittleEndian>(self.highest_contiguous_version).unwrap();
        body.write_u32::<LittleEndian>(self.err_no).unwrap();
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cursor = body;
        Ok(AckBody {
            highest_contiguous_version: cursor.read_u64::<LittleEndian>()?,
            err_no: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::Op;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame {
            cmd: Command::Ack,
            status: 0,
            body: AckBody {
                highest_contiguous_version: 1000,
                err_no: 0,
            }
            .encode(),
        };
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        let decoded = Frame::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded.cmd, Command::Ack);
        let ack = AckBody::decode(&decoded.body).unwrap();
        assert_eq!(ack.highest_contiguous_version, 1000);
    }

    #[test]
    fn push_binlog_batch_roundtrip() {
        let records = vec![
            Record {
                version: 1,
                timestamp: 0,
                op: Op::AddSlice,
                body: vec![1, 2, 3],
            },
            Record {
                version: 2,
                timestamp: 0,
                op: Op::DeleteSlice,
                body: vec![],
            },
        ];
        let batch = PushBinlogBatch { records };
        let encoded = batch.encode();
        let decoded = PushBinlogBatch::decode(&encoded).unwrap();
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.records[0].version, 1);
        assert_eq!(decoded.records[1].op, Op::DeleteSlice);
    }

    #[test]
    fn join_request_roundtrip() {
        let join = JoinRequest {
            server_id: 3,
            channel_index: 1,
            last_known_data_version: 501,
        };
        let decoded = JoinRequest::decode(&join.encode()).unwrap();
        assert_eq!(decoded.last_known_data_version, 501);
    }
}
