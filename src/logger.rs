//! Transfer journal: one line per transfer event in `file_transfer.log`.

use anyhow::Result;
use chrono::Utc;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::status::TransferStatus;

pub const LOG_FILE_NAME: &str = "file_transfer.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        })
    }
}

pub trait TransferLogger: Send + Sync {
    fn start(&self, _key: &str, _dir: Direction, _path: &Path) {}
    fn progress(&self, _key: &str, _bytes: u64, _total: u64) {}
    fn complete(&self, _key: &str, _dir: Direction, _bytes: u64) {}
    fn rejected(&self, _key: &str, _status: TransferStatus) {}
    fn error(&self, _key: &str, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl TextLogger {
    /// Open (append) `<dir>/file_transfer.log`, creating `dir` if needed.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::new(dir.as_ref().join(LOG_FILE_NAME))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(f),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl TransferLogger for TextLogger {
    fn start(&self, key: &str, dir: Direction, path: &Path) {
        self.line(&format!("START key={} dir={} path={}", key, dir, path.display()));
    }
    fn progress(&self, key: &str, bytes: u64, total: u64) {
        self.line(&format!("PROGRESS key={key} bytes={bytes} total={total}"));
    }
    fn complete(&self, key: &str, dir: Direction, bytes: u64) {
        self.line(&format!("DONE key={key} dir={dir} bytes={bytes}"));
    }
    fn rejected(&self, key: &str, status: TransferStatus) {
        self.line(&format!("REJECT key={key} status={status}"));
    }
    fn error(&self, key: &str, context: &str, msg: &str) {
        self.line(&format!("ERROR key={} ctx={} msg={}", key, context, msg));
    }
}
