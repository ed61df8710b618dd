//! filetx - client side: push a file to a peer, or fetch one by identity.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use filetx::cli::{init_tracing, ClientCommand, ClientOpts};
use filetx::{Outcome, QueryTicket, TransferEngine};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("set Ctrl-C handler")?;

    let opts = ClientOpts::parse();
    init_tracing(opts.engine.verbose);

    let mut cfg = opts.engine.resolve()?;
    if cfg.log_dir.is_none() {
        cfg.log_dir = Some(PathBuf::from("./logs/"));
    }
    let peer = cfg.addr();
    let mut engine = TransferEngine::client(cfg);
    engine.start().context("start engine")?;

    let res = match &opts.command {
        ClientCommand::Send { file, identity } => engine
            .send(file, &identity.identity())
            .with_context(|| format!("send {}", file.display()))?
            .wait(),
        ClientCommand::Query { identity } => match engine.query(&identity.identity())? {
            QueryTicket::Pending(status) => {
                println!("{}: {}", identity.identity(), status);
                return Ok(());
            }
            QueryTicket::Launched(handle) => handle.wait(),
        },
    };
    engine.stop();

    match res.with_context(|| format!("transfer with {}", peer))? {
        Outcome::Sent { bytes } => println!("sent {} bytes to {}", bytes, peer),
        Outcome::Received { path, bytes } => println!("received {} bytes into {}", bytes, path.display()),
        Outcome::Reply { info, status } => {
            if info.is_empty() {
                bail!("peer replied {}", status);
            }
            bail!("peer replied {}: {}", status, info);
        }
    }
    Ok(())
}
