//! Transfer engine: owns the event loop, the listener and the connection table.
//!
//! The loop is a single-threaded tokio runtime driven on its own OS thread.
//! Public operations may be called from any thread; each one that starts
//! work builds its own `Connection` and hands it to the loop.

use crate::action::Action;
use crate::config::{EngineConfig, Role};
use crate::connection::{Connection, Outcome};
use crate::error::{Result, TransferError};
use crate::identity::FileIdentity;
use crate::logger::{NoopLogger, TextLogger, TransferLogger};
use crate::protocol::timeouts::DRAIN_MS;
use crate::registry::{ConnectionId, TaskRegistry};
use crate::status::TransferStatus;
use crate::streamer::SendStrategy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// State every connection of one engine sees.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) logger: Arc<dyn TransferLogger>,
    pub(crate) strategy: SendStrategy,
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, AbortHandle>>,
}

impl Shared {
    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Spawn a connection task on the loop and record it in the table.
    /// The entry is inserted under the table lock, so the task's own
    /// removal can never run before the insert.
    fn track<F>(self: &Arc<Self>, rt: &Handle, id: ConnectionId, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut live = self.live.lock();
        let entry = LiveEntry {
            shared: Arc::clone(self),
            id,
        };
        let task = rt.spawn(async move {
            let _entry = entry;
            fut.await
        });
        live.insert(id, task.abort_handle());
    }

    fn active(&self) -> usize {
        self.live.lock().len()
    }
}

/// Removes a connection from the table when its task ends or is aborted.
struct LiveEntry {
    shared: Arc<Shared>,
    id: ConnectionId,
}

impl Drop for LiveEntry {
    fn drop(&mut self) {
        self.shared.live.lock().remove(&self.id);
    }
}

struct Running {
    handle: Handle,
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

pub struct TransferEngine {
    role: Role,
    shared: Arc<Shared>,
    running: Option<Running>,
    local_addr: Option<SocketAddr>,
}

impl TransferEngine {
    /// Engine that dials `config.host:config.port` for every send and query.
    pub fn client(config: EngineConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Engine that listens on `config.host:config.port`.
    pub fn server(config: EngineConfig) -> Self {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: EngineConfig) -> Self {
        let logger: Arc<dyn TransferLogger> = match &config.log_dir {
            Some(dir) => match TextLogger::in_dir(dir) {
                Ok(l) => {
                    debug!(journal = %l.path().display(), "transfer journal open");
                    Arc::new(l)
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "transfer journal disabled");
                    Arc::new(NoopLogger)
                }
            },
            None => Arc::new(NoopLogger),
        };
        let strategy = SendStrategy::detect(config.zero_copy);
        Self {
            role,
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(TaskRegistry::new()),
                logger,
                strategy,
                next_id: AtomicU64::new(0),
                live: Mutex::new(HashMap::new()),
            }),
            running: None,
            local_addr: None,
        }
    }

    /// Replace the journal. Only effective before `start`.
    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.logger = logger;
        }
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to (server role, after `start`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the loop. In server role the listener is bound here so a busy
    /// port is reported to the caller.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let listener = match self.role {
            Role::Server => {
                let addr = self.shared.config.addr();
                let bind_err = |source| TransferError::Bind {
                    addr: addr.clone(),
                    source,
                };
                let l = std::net::TcpListener::bind(&addr).map_err(bind_err)?;
                l.set_nonblocking(true).map_err(bind_err)?;
                self.local_addr = l.local_addr().ok();
                Some(l)
            }
            Role::Client => None,
        };

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        let (shutdown, rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("filetx-engine".to_string())
            .spawn(move || rt.block_on(run_loop(shared, listener, rx)))?;

        info!(role = ?self.role, addr = %self.shared.config.addr(), strategy = ?self.shared.strategy, "engine started");
        self.running = Some(Running {
            handle,
            shutdown,
            thread,
        });
        Ok(())
    }

    /// Stop accepting, let live connections finish within a grace window,
    /// abort the rest and join the loop thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if running.thread.join().is_err() {
            warn!("engine thread panicked");
        }
        self.local_addr = None;
        info!(role = ?self.role, "engine stopped");
    }

    fn loop_handle(&self) -> Result<&Handle> {
        self.running
            .as_ref()
            .map(|r| &r.handle)
            .ok_or(TransferError::NotRunning)
    }

    /// Push a local file to the peer.
    ///
    /// Errors returned here are pre-flight failures: no connection was
    /// attempted. Everything after that arrives through the handle.
    pub fn send(&self, path: impl AsRef<Path>, identity: &FileIdentity) -> Result<TransferHandle> {
        let rt = self.loop_handle()?;
        if self.role != Role::Client {
            return Err(TransferError::NoPeer);
        }
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            warn!(path = %path.display(), "file not exists");
            return Err(TransferError::MissingFile(path));
        }
        Action::send(identity, 0).encode()?;
        identity.check_storable().map_err(TransferError::Protocol)?;

        let key = identity.key();
        let id = self.shared.next_id();
        let lease = self
            .shared
            .registry
            .acquire(&key, TransferStatus::Send, id)
            .map_err(|status| {
                warn!(key = %key, %status, "has pending task");
                self.shared.logger.rejected(&key, status);
                TransferError::Conflict {
                    key: key.clone(),
                    status,
                }
            })?;

        let conn = Connection::new(id, Arc::clone(&self.shared));
        let identity = identity.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.track(rt, id, async move {
            let _ = tx.send(conn.run_send(path, identity, lease).await);
        });
        Ok(TransferHandle { id, key, rx })
    }

    /// Ask for a file by identity.
    ///
    /// A task already in flight for the key answers without any connection.
    /// In server role there is no peer to ask, so the local store answers.
    pub fn query(&self, identity: &FileIdentity) -> Result<QueryTicket> {
        let rt = self.loop_handle()?;
        let key = identity.key();
        if let Some(status) = self.shared.registry.lookup(&key) {
            debug!(key = %key, %status, "query answered by registry");
            return Ok(QueryTicket::Pending(status));
        }
        if self.role == Role::Server {
            let stored = identity.storage_path(&self.shared.config.recv_dir).is_file();
            return Ok(QueryTicket::Pending(if stored {
                TransferStatus::Ready
            } else {
                TransferStatus::Unknown
            }));
        }
        Action::query(identity).encode()?;
        identity.check_storable().map_err(TransferError::Protocol)?;

        let id = self.shared.next_id();
        let conn = Connection::new(id, Arc::clone(&self.shared));
        let identity = identity.clone();
        let (tx, rx) = oneshot::channel();
        self.shared.track(rt, id, async move {
            let _ = tx.send(conn.run_query(identity).await);
        });
        Ok(QueryTicket::Launched(TransferHandle { id, key, rx }))
    }

    /// Status of the task in flight for `identity`, if any.
    pub fn status(&self, identity: &FileIdentity) -> Option<TransferStatus> {
        self.shared.registry.lookup(&identity.key())
    }

    /// Connections currently in the table.
    pub fn active_connections(&self) -> usize {
        self.shared.active()
    }

    /// Tasks currently in the registry.
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.len()
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(shared: Arc<Shared>, listener: Option<std::net::TcpListener>, mut shutdown: watch::Receiver<bool>) {
    match listener.map(TcpListener::from_std) {
        Some(Ok(listener)) => accept_loop(&shared, listener, &mut shutdown).await,
        Some(Err(e)) => warn!(error = %e, "listener could not join the loop"),
        None => {
            let _ = shutdown.changed().await;
        }
    }
    drain(&shared).await;
}

async fn accept_loop(shared: &Arc<Shared>, listener: TcpListener, shutdown: &mut watch::Receiver<bool>) {
    let rt = Handle::current();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let id = shared.next_id();
                    debug!(conn = %id, %peer, "accepted");
                    let conn = Connection::new(id, Arc::clone(shared));
                    shared.track(&rt, id, async move {
                        let _ = conn.run_accept(stream).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("acceptor stopped");
}

async fn drain(shared: &Shared) {
    let deadline = Instant::now() + Duration::from_millis(DRAIN_MS);
    while shared.active() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let left: Vec<AbortHandle> = shared.live.lock().drain().map(|(_, h)| h).collect();
    if !left.is_empty() {
        warn!(connections = left.len(), "aborting connections still open at shutdown");
    }
    for h in left {
        h.abort();
    }
}

/// Completion side of a send or query running on the loop.
#[derive(Debug)]
pub struct TransferHandle {
    id: ConnectionId,
    key: String,
    rx: oneshot::Receiver<Result<Outcome>>,
}

impl TransferHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn outcome(self) -> Result<Outcome> {
        self.rx.await.unwrap_or(Err(TransferError::Aborted))
    }

    /// Block until the exchange ends. Must not be called from async code.
    pub fn wait(self) -> Result<Outcome> {
        self.rx.blocking_recv().unwrap_or(Err(TransferError::Aborted))
    }
}

/// Result of `TransferEngine::query`.
#[derive(Debug)]
pub enum QueryTicket {
    /// Answered locally, no connection was opened
    Pending(TransferStatus),
    /// A QUERY connection is running
    Launched(TransferHandle),
}

impl QueryTicket {
    pub fn status(&self) -> TransferStatus {
        match self {
            QueryTicket::Pending(status) => *status,
            QueryTicket::Launched(_) => TransferStatus::Query,
        }
    }
}
