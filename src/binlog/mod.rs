//! Binlog writer and record framing for one storage server.

pub mod record;
pub mod writer;

pub use record::{Op, Record};
pub use writer::{BinlogWriter, OrderMode, RecoveryReport};
