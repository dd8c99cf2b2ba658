//! Error types for the chatwire protocol.

use std::time::Duration;
use thiserror::Error;

/// Stream-level errors.
///
/// Any of these while reading a frame leaves the stream in an unknown
/// position, so the connection is torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream before a full field was read
    #[error("peer disconnected")]
    Disconnected,

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// String length prefix out of range
    #[error("invalid string length: {0}")]
    InvalidLength(i32),

    /// String field is not valid UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Opcode not allowed at this point of the conversation
    #[error("unexpected opcode {0}")]
    UnexpectedOpcode(u8),

    /// Peer did not complete the handshake in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Handshake carried an empty username
    #[error("handshake carried an empty username")]
    EmptyUsername,
}

/// Rejected transfer input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Declared file size is zero, negative or above the limit
    #[error("declared file size {size} is outside 1..={max}")]
    InvalidFileSize {
        /// Declared size
        size: i64,
        /// Configured maximum
        max: u64,
    },

    /// Chunk size is zero, negative or above the limit
    #[error("chunk size {size} is outside 1..={max}")]
    InvalidChunkSize {
        /// Declared chunk size
        size: i64,
        /// Configured maximum
        max: usize,
    },

    /// Chunk or completion arrived with no transfer in progress
    #[error("no transfer in progress")]
    NoActiveTransfer,

    /// Chunk would push the transfer past its declared size
    #[error("received {received} bytes for a transfer declared as {expected} bytes")]
    SizeExceeded {
        /// Declared size
        expected: u64,
        /// Bytes including the rejected chunk
        received: u64,
    },
}

/// Transfer state machine errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Input rejected
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Upload exceeded its time budget
    #[error("transfer timed out after {}s", elapsed.as_secs())]
    Timeout {
        /// Time since the transfer started
        elapsed: Duration,
    },

    /// Sink read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the transfer was aborted as a consequence of this error
    #[must_use]
    pub fn aborts_transfer(&self) -> bool {
        match self {
            TransferError::Validation(ValidationError::SizeExceeded { .. }) => true,
            TransferError::Validation(_) => false,
            TransferError::Timeout { .. } | TransferError::Io(_) => true,
        }
    }
}
