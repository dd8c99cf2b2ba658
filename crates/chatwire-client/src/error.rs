//! Error types for the client agent.

use chatwire_proto::{ProtocolError, TransferError, ValidationError};
use std::io;
use thiserror::Error;

/// Network agent errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect` called while a connection is live
    #[error("already connected")]
    AlreadyConnected,

    /// Operation needs a live connection
    #[error("not connected")]
    NotConnected,

    /// TCP connect failed or timed out
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Server address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Socket or file error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed input
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transfer rejected locally
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl From<ValidationError> for ClientError {
    fn from(err: ValidationError) -> Self {
        ClientError::Transfer(err.into())
    }
}
