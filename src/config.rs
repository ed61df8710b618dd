//! Engine configuration: defaults, optional TOML file, CLI overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::timeouts;

/// Whether the engine listens for peers or dials one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Peer host (client) or bind address (server)
    pub host: String,
    pub port: u16,
    pub recv_dir: PathBuf,
    /// Journal directory; no journal when unset
    pub log_dir: Option<PathBuf>,
    /// Prefer the kernel zero-copy send path when the platform has one
    pub zero_copy: bool,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6666,
            recv_dir: PathBuf::from("./files/"),
            log_dir: None,
            zero_copy: true,
            connect_timeout_ms: timeouts::CONNECT_MS,
            handshake_timeout_ms: timeouts::HANDSHAKE_MS,
            idle_timeout_ms: timeouts::IDLE_MS,
        }
    }
}

impl EngineConfig {
    pub fn new(host: impl Into<String>, port: u16, recv_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            recv_dir: recv_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: EngineConfig =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        timeouts::from_ms(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        timeouts::from_ms(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        timeouts::from_ms(self.idle_timeout_ms)
    }
}
