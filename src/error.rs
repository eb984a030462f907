use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error kinds surfaced by the storage core, matching the error taxonomy of
/// the source system rather than ad-hoc per-module error types.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("out of space")]
    OutOfSpace,

    #[error("not found")]
    NotFound,

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("timeout")]
    Timeout,
}

impl StorageError {
    /// Whether the operation that produced this error may be retried
    /// locally without surfacing it to the caller (only `BUSY`
    /// retries locally, everything else propagates).
    pub fn is_locally_retryable(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}
