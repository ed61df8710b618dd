//! Shared CLI helpers and Clap fragments for `filetx` and `filetxd`

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::EngineConfig;
use crate::identity::FileIdentity;

/// Engine settings accepted by both binaries. Flags override the config file.
#[derive(Clone, Debug, Default, Args)]
pub struct EngineArgs {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Peer host (client) or bind address (server)
    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory received files are stored under, as <recv-dir>/<type>/<key>
    #[arg(long = "recv-dir")]
    pub recv_dir: Option<PathBuf>,

    /// Directory for file_transfer.log
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Always use the buffered send path
    #[arg(long = "no-zero-copy")]
    pub no_zero_copy: bool,

    /// Debug-level diagnostics
    #[arg(short, long)]
    pub verbose: bool,
}

impl EngineArgs {
    pub fn resolve(&self) -> Result<EngineConfig> {
        let mut cfg = EngineConfig::load_or_default(self.config.as_deref())?;
        if let Some(h) = &self.host {
            cfg.host = h.clone();
        }
        if let Some(p) = self.port {
            cfg.port = p;
        }
        if let Some(d) = &self.recv_dir {
            cfg.recv_dir = d.clone();
        }
        if let Some(d) = &self.log_dir {
            cfg.log_dir = Some(d.clone());
        }
        if self.no_zero_copy {
            cfg.zero_copy = false;
        }
        Ok(cfg)
    }
}

/// The five identity fields of a logical file
#[derive(Clone, Debug, Args)]
pub struct IdentityArgs {
    #[arg(long)]
    pub id: String,

    #[arg(long = "type")]
    pub kind: String,

    #[arg(long)]
    pub date: String,

    #[arg(long)]
    pub begin: String,

    #[arg(long)]
    pub end: String,
}

impl IdentityArgs {
    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(&self.id, &self.kind, &self.date, &self.begin, &self.end)
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "filetx - push files to a filetxd peer or fetch them by identity")]
pub struct ClientOpts {
    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Push a local file to the peer
    Send {
        file: PathBuf,
        #[command(flatten)]
        identity: IdentityArgs,
    },
    /// Ask the peer for a file and store it under the receive directory
    Query {
        #[command(flatten)]
        identity: IdentityArgs,
    },
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "filetxd - accept pushed files and serve queries")]
pub struct ServerOpts {
    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Install the fmt subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "filetx=debug" } else { "filetx=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
