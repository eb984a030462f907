//! Binlog record framing : `version:u64, timestamp, op, body`,
//! length-delimited with a trailing CRC32 so the recovery scanner has a
//! positive well-formedness signal rather than relying purely on EOF/short
//! read heuristics.

use crate::error::{Result, StorageError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    AddSlice = 0,
    DeleteSlice = 1,
    DeleteBlock = 2,
    NoOp = 3,
}

impl Op {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Op::AddSlice,
            1 => Op::DeleteSlice,
            2 => Op::DeleteBlock,
            3 => Op::NoOp,
            _ => return Err(StorageError::ProtocolViolation(format!("unknown binlog op {v}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub version: u64,
    pub timestamp: i64,
    pub op: Op,
    pub body: Vec<u8>,
}

impl Record {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + 8 + 1 + self.body.len());
        payload.write_u64::<LittleEndian>(self.version).unwrap();
        payload.write_i64::<LittleEndian>(self.timestamp).unwrap();
        payload.write_u8(self.op as u8).unwrap();
        payload.extend_from_slice(&self.body);

        let crc = crc32fast::hash(&payload);
        let mut framed = Vec::with_capacity(4 + payload.len() + 4);
        framed.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
        framed.extend_from_slice(&payload);
        framed.write_u32::<LittleEndian>(crc).unwrap();
        framed
    }

    /// Reads one record from `reader`. Returns `Ok(None)` on a clean EOF
    /// (no bytes at all for the next length prefix) so callers can tell
    /// "file ends here" apart from "file is truncated mid-record".
    pub fn decode_one<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| StorageError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated record body")))?;

        let mut crc_buf = [0u8; 4];
        reader
            .read_exact(&mut crc_buf)
            .map_err(|_| StorageError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated record crc")))?;
        let expected_crc = u32::from_le_bytes(crc_buf);
        if crc32fast::hash(&payload) != expected_crc {
            return Err(StorageError::ProtocolViolation("binlog record failed crc check".into()));
        }

        let mut cursor = &payload[..];
        let version = cursor.read_u64::<LittleEndian>()?;
        let timestamp = cursor.read_i64::<LittleEndian>()?;
        let op = Op::from_u8(cursor.read_u8()?)?;
        let body = cursor.to_vec();

        Ok(Some(Record {
            version,
            timestamp,
            op,
            body,
        }))
    }

    /// Length in bytes this record occupies on disk once framed.
    pub fn framed_len(&self) -> usize {
        4 + 8 + 8 + 1 + self.body.len() + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let record = Record {
            version: 42,
            timestamp: 1_700_000_000,
            op: Op::AddSlice,
            body: vec![1, 2, 3, 4],
        };
        let framed = record.encode();
        assert_eq!(framed.len(), record.framed_len());
        let mut cursor = &framed[..];
        let decoded = Record::decode_one(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded.version, 42);
        assert_eq!(decoded.op, Op::AddSlice);
        assert_eq!(decoded.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn decode_one_returns_none_on_clean_eof() {
        let mut cursor: &[u8] = &[];
        assert!(Record::decode_one(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn detects_corrupted_crc() {
        let record = Record {
            version: 1,
            timestamp: 0,
            op: Op::NoOp,
            body: vec![],
        };
        let mut framed = record.encode();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        let mut cursor = &framed[..];
        assert!(matches!(
            Record::decode_one(&mut cursor),
            Err(StorageError::ProtocolViolation(_))
        ));
    }
}
