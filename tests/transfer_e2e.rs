use anyhow::Result;
use filetx::{
    EngineConfig, FileIdentity, Outcome, QueryTicket, TransferEngine, TransferError, TransferStatus,
};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(7);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn identity() -> FileIdentity {
    FileIdentity::new("xiaomi", "ts", "20200606", "930", "1530")
}

fn start_server(root: &Path) -> Result<TransferEngine> {
    let mut server = TransferEngine::server(EngineConfig::new("127.0.0.1", 0, root));
    server.start()?;
    Ok(server)
}

fn start_client(server: &TransferEngine, root: &Path, zero_copy: bool) -> Result<TransferEngine> {
    let port = server
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server has no local address"))?
        .port();
    start_client_at(port, root, |cfg| cfg.zero_copy = zero_copy)
}

fn start_client_at(port: u16, root: &Path, tune: impl FnOnce(&mut EngineConfig)) -> Result<TransferEngine> {
    let mut cfg = EngineConfig::new("127.0.0.1", port, root);
    tune(&mut cfg);
    let mut client = TransferEngine::client(cfg);
    client.start()?;
    Ok(client)
}

// Larger than loopback socket buffers, so a peer that never reads stalls the push
const STALL_BYTES: usize = 32 * 1024 * 1024;

async fn eventually(what: &str, check: impl Fn() -> bool) -> Result<()> {
    for _ in 0..250u32 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("timed out waiting for {}", what)
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_then_query_roundtrip() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;

    let src = cli_src.path().join("input.bin");
    write_file(&src, 100_000)?;
    let pusher = start_client(&server, cli_src.path(), true)?;
    let outcome = pusher.send(&src, &identity())?.outcome().await?;
    assert_eq!(outcome, Outcome::Sent { bytes: 100_000 });

    let stored = srv_root.path().join("ts").join("xiaomi_ts_20200606_930_1530");
    eventually("server to finish the receive", || {
        server.pending_tasks() == 0 && file_len(&stored) == Some(100_000)
    })
    .await?;
    assert_eq!(std::fs::read(&stored)?, std::fs::read(&src)?);
    assert!(pusher.registry().is_empty());

    // A clean engine with its own receive root fetches the same file back
    let fetcher = start_client(&server, cli_dst.path(), true)?;
    let handle = match fetcher.query(&identity())? {
        QueryTicket::Launched(h) => h,
        QueryTicket::Pending(s) => anyhow::bail!("unexpected local answer {}", s),
    };
    let fetched = cli_dst.path().join("ts").join("xiaomi_ts_20200606_930_1530");
    match handle.outcome().await? {
        Outcome::Received { path, bytes } => {
            assert_eq!(path, fetched);
            assert_eq!(bytes, 100_000);
        }
        other => anyhow::bail!("expected a file, got {:?}", other),
    }
    assert_eq!(std::fs::read(&fetched)?, std::fs::read(&src)?);
    eventually("server serve to release its task", || server.pending_tasks() == 0).await?;
    assert!(fetcher.registry().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_push_crosses_mib_boundaries() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let client = start_client(&server, cli_src.path(), false)?;

    let src = cli_src.path().join("big.bin");
    write_file(&src, 2 * 1024 * 1024 + 4321)?;
    let id = FileIdentity::new("dev1", "raw", "20210101", "0", "2359");
    let outcome = client.send(&src, &id)?.outcome().await?;
    assert_eq!(outcome, Outcome::Sent { bytes: 2 * 1024 * 1024 + 4321 });

    let stored = id.storage_path(srv_root.path());
    eventually("server to finish the receive", || {
        server.pending_tasks() == 0 && file_len(&stored) == Some(2 * 1024 * 1024 + 4321)
    })
    .await?;
    assert_eq!(std::fs::read(&stored)?, std::fs::read(&src)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_is_stored_empty() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let client = start_client(&server, cli_src.path(), true)?;

    let src = cli_src.path().join("empty.bin");
    write_file(&src, 0)?;
    let outcome = client.send(&src, &identity())?.outcome().await?;
    assert_eq!(outcome, Outcome::Sent { bytes: 0 });

    let stored = identity().storage_path(srv_root.path());
    eventually("empty file on server", || {
        server.pending_tasks() == 0 && file_len(&stored) == Some(0)
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_for_missing_file_replies_unknown() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let client = start_client(&server, cli_dst.path(), true)?;

    let handle = match client.query(&identity())? {
        QueryTicket::Launched(h) => h,
        QueryTicket::Pending(s) => anyhow::bail!("unexpected local answer {}", s),
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.outcome()).await??;
    assert_eq!(
        outcome,
        Outcome::Reply {
            info: "file not exists".to_string(),
            status: TransferStatus::Unknown,
        }
    );
    assert!(!identity().storage_path(cli_dst.path()).exists());
    assert!(client.registry().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_during_receive_reports_recv() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let addr = server
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server has no local address"))?;

    // Hold a receive open on the server from a bare socket
    let mut raw = tokio::net::TcpStream::connect(addr).await?;
    raw.write_all(b"CMD=SEND,ID=xiaomi,TYPE=ts,DATE=20200606,BEGIN=930,END=1530,SIZE=10,;abc")
        .await?;
    eventually("server to register the receive", || {
        server.status(&identity()) == Some(TransferStatus::Recv)
    })
    .await?;

    let client = start_client(&server, cli_dst.path(), true)?;
    let handle = match client.query(&identity())? {
        QueryTicket::Launched(h) => h,
        QueryTicket::Pending(s) => anyhow::bail!("unexpected local answer {}", s),
    };
    match handle.outcome().await? {
        Outcome::Reply { status, .. } => assert_eq!(status, TransferStatus::Recv),
        other => anyhow::bail!("partial file was served: {:?}", other),
    }
    assert!(!identity().storage_path(cli_dst.path()).exists());

    // A second push of the same key is turned away while the first is open
    let mut dup = tokio::net::TcpStream::connect(addr).await?;
    dup.write_all(b"CMD=SEND,ID=xiaomi,TYPE=ts,DATE=20200606,BEGIN=930,END=1530,SIZE=3,;")
        .await?;
    let mut answer = String::new();
    dup.read_to_string(&mut answer).await?;
    assert!(answer.starts_with("CMD=REPLY,"), "{}", answer);
    assert!(answer.contains("INFO=transfer already in progress"), "{}", answer);
    assert!(answer.contains("STATUS=3"), "{}", answer);

    // Short bulk phase: the server drops the task and keeps what arrived
    drop(raw);
    eventually("server to release the receive", || server.pending_tasks() == 0).await?;
    assert_eq!(std::fs::read(identity().storage_path(srv_root.path()))?, b"abc");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_local_send_is_refused() -> Result<()> {
    let cli_src = tempfile::tempdir()?;
    // Accepts but never reads: the first push stays in flight
    let peer = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let client = start_client_at(peer.local_addr()?.port(), cli_src.path(), |_| {})?;

    let src = cli_src.path().join("input.bin");
    write_file(&src, STALL_BYTES)?;
    let first = client.send(&src, &identity())?;
    let (held, _) = peer.accept().await?;

    match client.send(&src, &identity()) {
        Err(TransferError::Conflict { key, status }) => {
            assert_eq!(key, "xiaomi_ts_20200606_930_1530");
            assert_eq!(status, TransferStatus::Send);
        }
        other => anyhow::bail!("second send was admitted: {:?}", other),
    }
    match client.query(&identity())? {
        QueryTicket::Pending(s) => assert_eq!(s, TransferStatus::Send),
        QueryTicket::Launched(_) => anyhow::bail!("query opened a connection for a pending key"),
    }
    assert_eq!(client.active_connections(), 1);

    // Peer goes away mid-stream: the push fails and releases the key
    drop(held);
    assert!(first.outcome().await.is_err());
    assert!(client.registry().is_empty());

    let again = client.send(&src, &identity())?;
    let (held, _) = peer.accept().await?;
    drop(held);
    assert!(again.outcome().await.is_err());
    assert!(client.registry().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_peer_hits_handshake_timeout() -> Result<()> {
    let cli_dst = tempfile::tempdir()?;
    let peer = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let client = start_client_at(peer.local_addr()?.port(), cli_dst.path(), |cfg| {
        cfg.handshake_timeout_ms = 300;
    })?;

    let handle = match client.query(&identity())? {
        QueryTicket::Launched(h) => h,
        QueryTicket::Pending(s) => anyhow::bail!("unexpected local answer {}", s),
    };
    let (_held, _) = peer.accept().await?;
    match tokio::time::timeout(Duration::from_secs(5), handle.outcome()).await? {
        Err(TransferError::Timeout { phase, after }) => {
            assert_eq!(phase, "handshake read");
            assert_eq!(after, Duration::from_millis(300));
        }
        other => anyhow::bail!("expected a handshake timeout, got {:?}", other),
    }
    assert_eq!(client.active_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_push_hits_idle_timeout() -> Result<()> {
    let cli_src = tempfile::tempdir()?;
    let peer = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let client = start_client_at(peer.local_addr()?.port(), cli_src.path(), |cfg| {
        cfg.idle_timeout_ms = 300;
    })?;

    let src = cli_src.path().join("input.bin");
    write_file(&src, STALL_BYTES)?;
    let handle = client.send(&src, &identity())?;
    let (_held, _) = peer.accept().await?;
    match tokio::time::timeout(Duration::from_secs(10), handle.outcome()).await? {
        Err(TransferError::Incomplete { transferred, expected, reason, .. }) => {
            assert!(transferred < expected);
            assert!(reason.contains("bulk send timeout"), "{}", reason);
        }
        other => anyhow::bail!("expected a stalled push to time out, got {:?}", other),
    }
    assert!(client.registry().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_aborts_a_stalled_push() -> Result<()> {
    let cli_src = tempfile::tempdir()?;
    let peer = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    // Zero disables every deadline, so only stop can end this push
    let mut client = start_client_at(peer.local_addr()?.port(), cli_src.path(), |cfg| {
        cfg.handshake_timeout_ms = 0;
        cfg.idle_timeout_ms = 0;
    })?;

    let src = cli_src.path().join("input.bin");
    write_file(&src, STALL_BYTES)?;
    let handle = client.send(&src, &identity())?;
    let (_held, _) = peer.accept().await?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.status(&identity()), Some(TransferStatus::Send));
    assert_eq!(client.active_connections(), 1);

    client.stop();
    assert!(matches!(handle.outcome().await, Err(TransferError::Aborted)));
    assert_eq!(client.pending_tasks(), 0);
    assert_eq!(client.active_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_local_file_fails_before_connecting() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let client = start_client(&server, cli_src.path(), true)?;

    let missing = cli_src.path().join("nope.bin");
    assert!(matches!(
        client.send(&missing, &identity()),
        Err(TransferError::MissingFile(_))
    ));
    assert_eq!(client.active_connections(), 0);
    assert!(client.registry().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_handshake_closes_only_that_connection() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;
    let server = start_server(srv_root.path())?;
    let addr = server
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server has no local address"))?;

    let mut raw = tokio::net::TcpStream::connect(addr).await?;
    raw.write_all(b"CMD=REPLY,INFO=hello,STATUS=0,;").await?;
    let mut rest = Vec::new();
    let _ = raw.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    let mut raw = tokio::net::TcpStream::connect(addr).await?;
    raw.write_all(b"CMD=SEND,ID=a,TYPE=..,DATE=d,BEGIN=b,END=e,SIZE=0,;").await?;
    let mut rest = Vec::new();
    let _ = raw.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    assert_eq!(server.pending_tasks(), 0);

    // The acceptor is still serving
    let client = start_client(&server, cli_dst.path(), true)?;
    let handle = match client.query(&identity())? {
        QueryTicket::Launched(h) => h,
        QueryTicket::Pending(s) => anyhow::bail!("unexpected local answer {}", s),
    };
    assert!(matches!(handle.outcome().await?, Outcome::Reply { .. }));
    eventually("connections to close", || server.active_connections() == 0).await?;
    Ok(())
}
