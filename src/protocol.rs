//! Shared protocol constants for the filetx handshake and bulk phases

// Handshake grammar: CMD=<cmd>,K=V,...,;
pub const FIELD_SEP: char = ',';
pub const KV_SEP: char = '=';
pub const TERMINATOR: char = ';';

// Largest handshake message accepted before the terminator is seen
pub const MAX_ACTION_LEN: usize = 4 * 1024;

// Option keys (case-sensitive on the wire)
pub mod keys {
    pub const CMD: &str = "CMD";
    pub const ID: &str = "ID";
    pub const TYPE: &str = "TYPE";
    pub const DATE: &str = "DATE";
    pub const BEGIN: &str = "BEGIN";
    pub const END: &str = "END";
    pub const SIZE: &str = "SIZE";
    pub const INFO: &str = "INFO";
    pub const STATUS: &str = "STATUS";
}

// Reply texts
pub mod info {
    pub const FILE_NOT_EXISTS: &str = "file not exists";
    pub const NOT_READY: &str = "not ready";
    pub const IN_PROGRESS: &str = "transfer already in progress";
}

pub const MIB: u64 = 1024 * 1024;

// Receive path reads the socket in 4 KiB chunks
pub const RECV_CHUNK: usize = 4 * 1024;

// Zero-copy path hands the kernel at most 1 MiB per call so the loop stays responsive
pub const SEND_BURST: usize = 1024 * 1024;

// Buffered send path staging buffer
pub const SEND_BUFFER: usize = 256 * 1024;

// Default per-phase deadlines (ms); 0 disables a deadline
pub mod timeouts {
    use crate::error::{Result, TransferError};
    use std::future::Future;
    use std::time::Duration;

    pub const CONNECT_MS: u64 = 5_000;
    pub const HANDSHAKE_MS: u64 = 10_000;
    // Longest wait for a single bulk chunk to make progress
    pub const IDLE_MS: u64 = 60_000;
    // Grace period for live connections when the engine stops
    pub const DRAIN_MS: u64 = 5_000;

    pub fn from_ms(ms: u64) -> Option<Duration> {
        if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }

    /// Run `fut`, failing with `Timeout { phase }` if a deadline is set and elapses.
    pub async fn with_deadline<T, F>(phase: &'static str, deadline: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match deadline {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(res) => res,
                Err(_) => Err(TransferError::Timeout { phase, after }),
            },
            None => fut.await,
        }
    }
}

/// True when a byte counter moving from `before` to `after` completes another whole MiB.
pub fn mib_crossed(before: u64, after: u64) -> bool {
    after / MIB > before / MIB
}
