use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc;

use filetx::cli::{init_tracing, ServerOpts};
use filetx::TransferEngine;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    init_tracing(opts.engine.verbose);
    let cfg = opts.engine.resolve()?;

    std::fs::create_dir_all(&cfg.recv_dir)
        .with_context(|| format!("create receive directory {}", cfg.recv_dir.display()))?;

    println!("Starting filetx daemon:");
    println!("  Bind: {}", cfg.addr());
    println!("  Receive dir: {}", cfg.recv_dir.display());
    if let Some(dir) = &cfg.log_dir {
        println!("  Journal: {}", dir.display());
    }

    let mut engine = TransferEngine::server(cfg);
    engine.start().context("start engine")?;
    if let Some(addr) = engine.local_addr() {
        println!("Listening on {}", addr);
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("set Ctrl-C handler")?;
    let _ = rx.recv();

    eprintln!("\nShutting down...");
    engine.stop();
    Ok(())
}
