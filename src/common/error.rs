//! Error types for quorumlog

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Position not found: {0}")]
    NotFound(u64),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    // === Log Errors (caller visible) ===
    /// A quorum did not answer before the deadline. The operation may
    /// have been applied on a minority of replicas.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The writer was superseded by a higher ballot or invalidated by an
    /// earlier failure; a new writer has to be elected.
    #[error("Writer failed: {0}")]
    WriterFailed(String),

    /// Invalid position bounds, or a storage fault that left no healthy
    /// quorum. The two are reported the same way.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Malformed position identity: {0}")]
    Format(String),

    #[error("Log has been closed")]
    LogClosed,

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    /// Does this error invalidate the writer that produced it?
    ///
    /// Timeouts leave a pending proposal to finish later and rejected
    /// arguments never reach the group, so neither costs the election.
    pub fn invalidates_writer(&self) -> bool {
        !matches!(
            self,
            Error::Timeout(_) | Error::LogClosed | Error::OperationFailed(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
