//! Bulk file transfer over an already connected socket.
//!
//! Sending has two strategies behind one `SendStrategy`: the kernel zero-copy
//! path (`sendfile(2)`, Linux) and a buffered read/write loop used everywhere
//! else. Receiving appends 4 KiB socket reads to a lazily opened file until
//! the peer closes its write side.

use crate::error::{Result, TransferError};
use crate::logger::{Direction, TransferLogger};
use crate::protocol::timeouts::with_deadline;
use crate::protocol::{mib_crossed, RECV_CHUNK, SEND_BUFFER};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Per-MiB progress reporting shared by all bulk paths.
pub struct Progress<'a> {
    key: &'a str,
    total: u64,
    dir: Direction,
    logger: &'a dyn TransferLogger,
}

impl<'a> Progress<'a> {
    pub fn new(key: &'a str, total: u64, dir: Direction, logger: &'a dyn TransferLogger) -> Self {
        Self {
            key,
            total,
            dir,
            logger,
        }
    }

    pub fn advance(&self, before: u64, after: u64) {
        if !mib_crossed(before, after) {
            return;
        }
        let rest = self.total.saturating_sub(after);
        if self.total > 0 {
            let percentage = after as f64 / self.total as f64;
            info!(key = self.key, dir = %self.dir, bytes = after, rest, percentage, "transfer progress");
        } else {
            info!(key = self.key, dir = %self.dir, bytes = after, "transfer progress");
        }
        self.logger.progress(self.key, after, self.total);
    }
}

/// Terminal outcome of a send: either every byte went out, or the transfer
/// stopped early with the error that ended it.
#[derive(Debug)]
pub struct SendReport {
    pub sent: u64,
    pub expected: u64,
    pub error: Option<TransferError>,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.sent == self.expected
    }

    pub fn into_result(self, key: &str) -> Result<u64> {
        match self.error {
            None if self.sent == self.expected => Ok(self.sent),
            None => Err(TransferError::Incomplete {
                key: key.to_string(),
                transferred: self.sent,
                expected: self.expected,
                reason: "source ended early".to_string(),
            }),
            Some(e) => Err(TransferError::Incomplete {
                key: key.to_string(),
                transferred: self.sent,
                expected: self.expected,
                reason: e.to_string(),
            }),
        }
    }
}

pub const fn zero_copy_available() -> bool {
    cfg!(target_os = "linux")
}

/// How file bytes reach the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStrategy {
    ZeroCopy,
    Buffered,
}

impl SendStrategy {
    /// Pick the zero-copy path when asked for and the platform has one.
    pub fn detect(prefer_zero_copy: bool) -> Self {
        if prefer_zero_copy && zero_copy_available() {
            SendStrategy::ZeroCopy
        } else {
            SendStrategy::Buffered
        }
    }

    /// Stream exactly `len` bytes of `file` (positioned at 0) to `stream`.
    pub async fn send_file(
        self,
        stream: &mut TcpStream,
        file: std::fs::File,
        len: u64,
        progress: &Progress<'_>,
        idle: Option<Duration>,
    ) -> SendReport {
        debug!(strategy = ?self, len, "bulk send");
        match self {
            SendStrategy::ZeroCopy => send_zero_copy(stream, file, len, progress, idle).await,
            SendStrategy::Buffered => {
                let mut file = tokio::fs::File::from_std(file);
                send_buffered(stream, &mut file, len, progress, idle).await
            }
        }
    }
}

#[cfg(target_os = "linux")]
async fn send_zero_copy(
    stream: &mut TcpStream,
    file: std::fs::File,
    len: u64,
    progress: &Progress<'_>,
    idle: Option<Duration>,
) -> SendReport {
    use crate::protocol::SEND_BURST;
    use std::io::ErrorKind;
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    let in_fd = file.as_raw_fd();
    let out_fd = stream.as_raw_fd();
    let mut offset: libc::off_t = 0;
    let mut sent = 0u64;
    let mut error = None;

    while sent < len {
        let burst = (len - sent).min(SEND_BURST as u64) as usize;
        let ready = with_deadline("bulk send", idle, async {
            stream.writable().await?;
            Ok::<(), TransferError>(())
        })
        .await;
        if let Err(e) = ready {
            error = Some(e);
            break;
        }
        let res = stream.try_io(Interest::WRITABLE, || {
            let n = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, burst) };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        match res {
            Ok(0) => {
                // source shrank underneath us
                error = Some(TransferError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "sendfile made no progress",
                )));
                break;
            }
            Ok(n) => {
                let before = sent;
                sent += n as u64;
                progress.advance(before, sent);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                continue
            }
            Err(e) => {
                error = Some(TransferError::Io(e));
                break;
            }
        }
    }

    SendReport {
        sent,
        expected: len,
        error,
    }
}

// No kernel zero-copy primitive wired up on this platform
#[cfg(not(target_os = "linux"))]
async fn send_zero_copy(
    stream: &mut TcpStream,
    file: std::fs::File,
    len: u64,
    progress: &Progress<'_>,
    idle: Option<Duration>,
) -> SendReport {
    let mut file = tokio::fs::File::from_std(file);
    send_buffered(stream, &mut file, len, progress, idle).await
}

/// Read into a bounded buffer and write it fully, until `len` bytes or EOF.
pub async fn send_buffered<R, W>(
    stream: &mut W,
    file: &mut R,
    len: u64,
    progress: &Progress<'_>,
    idle: Option<Duration>,
) -> SendReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SEND_BUFFER];
    let mut sent = 0u64;
    let mut error = None;

    while sent < len {
        let want = (len - sent).min(buf.len() as u64) as usize;
        let n = match file.read(&mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error = Some(TransferError::Io(e));
                break;
            }
        };
        let written = with_deadline("bulk send", idle, async {
            stream.write_all(&buf[..n]).await?;
            Ok::<(), TransferError>(())
        })
        .await;
        if let Err(e) = written {
            error = Some(e);
            break;
        }
        let before = sent;
        sent += n as u64;
        progress.advance(before, sent);
    }
    if error.is_none() {
        if let Err(e) = stream.flush().await {
            error = Some(TransferError::Io(e));
        }
    }

    SendReport {
        sent,
        expected: len,
        error,
    }
}

/// Receive side of a bulk transfer into `<root>/<kind>/<key>`.
///
/// The output file is opened on the first chunk. A zero-byte read is the
/// normal end of transfer. The byte count is not checked against the
/// advertised size here; that is up to the caller. On error the partial file
/// is left in place.
pub struct FileReceiver {
    dir: PathBuf,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    received: u64,
}

impl FileReceiver {
    pub fn new(dir: PathBuf, path: PathBuf) -> Self {
        Self {
            dir,
            path,
            file: None,
            received: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    async fn create(&self) -> Result<tokio::fs::File> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let f = tokio::fs::File::create(&self.path).await?;
        info!(path = %self.path.display(), "recv");
        Ok(f)
    }

    async fn open(&mut self) -> Result<&mut tokio::fs::File> {
        let file = match self.file.take() {
            Some(f) => f,
            None => self.create().await?,
        };
        Ok(self.file.insert(file))
    }

    async fn write_chunk(&mut self, data: &[u8], progress: &Progress<'_>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.open().await?.write_all(data).await?;
        let before = self.received;
        self.received += data.len() as u64;
        progress.advance(before, self.received);
        Ok(())
    }

    /// Write `prefix` (bytes that arrived with the handshake) and then every
    /// chunk read from `stream` until the peer closes. Returns bytes received.
    pub async fn receive<S>(
        &mut self,
        stream: &mut S,
        prefix: &[u8],
        progress: &Progress<'_>,
        idle: Option<Duration>,
    ) -> Result<u64>
    where
        S: AsyncRead + Unpin,
    {
        self.write_chunk(prefix, progress).await?;
        let mut buf = vec![0u8; RECV_CHUNK];
        loop {
            let n = with_deadline("bulk receive", idle, async {
                Ok::<usize, TransferError>(stream.read(&mut buf).await?)
            })
            .await?;
            if n == 0 {
                break;
            }
            self.write_chunk(&buf[..n], progress).await?;
        }
        self.finish(false).await?;
        Ok(self.received)
    }

    /// Flush the output file. With `ensure_exists`, an empty file is created
    /// when no bytes arrived at all.
    pub async fn finish(&mut self, ensure_exists: bool) -> Result<()> {
        if self.file.is_none() && ensure_exists {
            self.open().await?;
        }
        if let Some(f) = self.file.as_mut() {
            f.flush().await?;
        }
        Ok(())
    }
}
