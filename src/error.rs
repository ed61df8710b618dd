//! Error types for the transfer engine.

use crate::status::TransferStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a transfer attempt.
///
/// Every error is local to the connection that produced it; the engine keeps
/// serving other connections.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Address resolution or TCP connect failed
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Listening socket could not be bound
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unexpected handshake
    #[error("protocol error: {0}")]
    Protocol(String),

    /// File or socket I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bulk phase ended before the expected byte count was reached
    #[error("{key}: transfer incomplete ({transferred} of {expected} bytes): {reason}")]
    Incomplete {
        key: String,
        transferred: u64,
        expected: u64,
        reason: String,
    },

    /// Another connection already owns this logical file
    #[error("{key}: transfer already in progress ({status})")]
    Conflict { key: String, status: TransferStatus },

    /// Local file to send does not exist
    #[error("file not exists: {}", .0.display())]
    MissingFile(PathBuf),

    /// A per-phase deadline elapsed
    #[error("{phase} timeout after {} ms", .after.as_millis())]
    Timeout { phase: &'static str, after: Duration },

    /// Operation requires a started engine
    #[error("engine is not running")]
    NotRunning,

    /// Outbound operation on an engine that has no peer address
    #[error("engine has no peer to connect to")]
    NoPeer,

    /// Connection task was cancelled by engine shutdown
    #[error("transfer aborted")]
    Aborted,
}

impl TransferError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
