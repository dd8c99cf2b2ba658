//! # chatwire protocol
//!
//! Wire protocol shared by the chatwire server and client.
//!
//! This crate provides:
//! - Frame encoding and decoding over any async byte stream
//! - Typed client and server frames
//! - The file transfer state machine used for uploads and downloads
//! - File-name sanitization
//! - System notices about refused or failed downloads
//! - Error types and handling
//!
//! ## Wire format
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ opcode │ opcode-specific fields                       │
//! │ 1 byte │ string = [i32 LE byte length][UTF-8 bytes]   │
//! │        │ int32 / int64 = 4 / 8 bytes little-endian    │
//! └────────┴──────────────────────────────────────────────┘
//! ```
//!
//! There is no frame-level length prefix: the receiver knows from the opcode
//! exactly which fields follow.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod name;
pub mod notice;
pub mod transfer;

use std::time::Duration;

pub use error::{ProtocolError, TransferError, ValidationError};
pub use frame::{ClientFrame, FrameBuilder, FrameReader, Opcode, ServerFrame};
pub use name::{is_safe_file_name, sanitize_file_name};
pub use notice::DownloadNotice;
pub use transfer::{
    ChunkProgress, CompletedTransfer, FileSink, MemorySink, Transfer, TransferLimits,
    TransferSink, TransferState,
};

/// Default TCP port of the chat relay
pub const DEFAULT_PORT: u16 = 9000;

/// Largest file accepted for upload (2 GiB)
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Largest chunk accepted in a single frame (10 MiB)
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Chunk size used when streaming files (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Longest string field accepted on the wire (1 MiB)
pub const MAX_STRING_LEN: usize = 1024 * 1024;

/// Upload inactivity limit measured from upload start (600 seconds)
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
