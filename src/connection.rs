//! Per-socket transfer state machine.
//!
//! A `Connection` serves exactly one logical exchange and then closes:
//!
//! ```text
//! outbound: Init -> Connecting -> HandshakeSent -> {SendingFile | ReceivingFile} -> Closed
//! inbound:  Init -> HandshakeReceiving -> {SendingFile | ReceivingFile | Replying} -> Closed
//! ```
//!
//! `Closed` is reached once. Closing shuts the socket down and drops any
//! registry lease, so the logical file is free again whatever the outcome.

use crate::action::{read_action, write_action, Action, Command};
use crate::engine::Shared;
use crate::error::{Result, TransferError};
use crate::identity::FileIdentity;
use crate::logger::Direction;
use crate::protocol::info as reply_info;
use crate::protocol::timeouts::with_deadline;
use crate::registry::{ConnectionId, TaskLease};
use crate::status::TransferStatus;
use crate::streamer::{FileReceiver, Progress};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    HandshakeSent,
    HandshakeReceiving,
    SendingFile,
    ReceivingFile,
    Replying,
    Closed,
}

impl ConnState {
    fn can_become(self, next: ConnState) -> bool {
        use ConnState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Init, Connecting) | (Init, HandshakeReceiving) => true,
            (Connecting, HandshakeSent) => true,
            (HandshakeSent, SendingFile) | (HandshakeSent, ReceivingFile) => true,
            (HandshakeReceiving, SendingFile)
            | (HandshakeReceiving, ReceivingFile)
            | (HandshakeReceiving, Replying) => true,
            _ => false,
        }
    }
}

/// How an exchange ended, as seen by the side that ran it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// File bytes were streamed to the peer
    Sent { bytes: u64 },
    /// A file was stored under the receive root
    Received { path: PathBuf, bytes: u64 },
    /// A REPLY was exchanged instead of a file
    Reply { info: String, status: TransferStatus },
}

pub struct Connection {
    id: ConnectionId,
    shared: Arc<Shared>,
    state: ConnState,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    identity: Option<FileIdentity>,
    lease: Option<TaskLease>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            state: ConnState::Init,
            stream: None,
            peer: None,
            identity: None,
            lease: None,
        }
    }

    fn key(&self) -> String {
        self.identity.as_ref().map(|i| i.key()).unwrap_or_default()
    }

    fn transition(&mut self, next: ConnState) {
        if !self.state.can_become(next) {
            warn!(conn = %self.id, from = ?self.state, to = ?next, "illegal state transition");
            return;
        }
        debug!(conn = %self.id, from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransferError::protocol("connection has no socket"))
    }

    /// Push a local file. The caller has already checked the file and taken
    /// the SEND lease for its key.
    pub(crate) async fn run_send(mut self, path: PathBuf, identity: FileIdentity, lease: TaskLease) -> Result<Outcome> {
        info!(conn = %self.id, key = %identity, path = %path.display(), "start send");
        self.identity = Some(identity.clone());
        self.lease = Some(lease);
        let res = self.push(&path, &identity).await;
        self.settle("send", res).await
    }

    async fn push(&mut self, path: &Path, identity: &FileIdentity) -> Result<Outcome> {
        self.connect().await?;
        let bytes = self.stream_file(path, identity).await?;
        Ok(Outcome::Sent { bytes })
    }

    /// Ask the peer for a file; receive it if the peer answers with SEND.
    pub(crate) async fn run_query(mut self, identity: FileIdentity) -> Result<Outcome> {
        info!(conn = %self.id, key = %identity, "start query");
        self.identity = Some(identity.clone());
        let res = self.ask(&identity).await;
        self.settle("query", res).await
    }

    async fn ask(&mut self, identity: &FileIdentity) -> Result<Outcome> {
        self.connect().await?;
        let deadline = self.shared.config.handshake_timeout();
        write_action(self.stream_mut()?, &Action::query(identity), deadline).await?;
        self.transition(ConnState::HandshakeSent);

        let (answer, rest) = read_action(self.stream_mut()?, deadline).await?;
        match answer.command {
            Some(Command::Send) => {
                let offered = answer.identity();
                if offered.key() != identity.key() {
                    return Err(TransferError::protocol(format!(
                        "asked for {} but peer offered {}",
                        identity.key(),
                        offered.key()
                    )));
                }
                let lease = self
                    .shared
                    .registry
                    .acquire(&identity.key(), TransferStatus::Recv, self.id)
                    .map_err(|status| self.conflict(identity, status))?;
                self.lease = Some(lease);
                self.receive_file(identity, &answer, rest).await
            }
            Some(Command::Reply) => {
                let status = answer.status();
                info!(conn = %self.id, key = %identity, info = answer.info(), %status, "reply");
                Ok(Outcome::Reply {
                    info: answer.info().to_string(),
                    status,
                })
            }
            Some(Command::Query) => Err(TransferError::protocol("peer answered a QUERY with a QUERY")),
            None => Err(TransferError::protocol("peer answer has no usable CMD")),
        }
    }

    /// Serve one accepted socket.
    pub(crate) async fn run_accept(mut self, stream: TcpStream) -> Result<Outcome> {
        let _ = stream.set_nodelay(true);
        self.peer = stream.peer_addr().ok();
        self.stream = Some(stream);
        info!(conn = %self.id, peer = ?self.peer, "start recv");
        self.transition(ConnState::HandshakeReceiving);
        let res = self.answer().await;
        self.settle("accept", res).await
    }

    async fn answer(&mut self) -> Result<Outcome> {
        let deadline = self.shared.config.handshake_timeout();
        let (action, rest) = read_action(self.stream_mut()?, deadline).await?;
        let identity = action.identity();
        self.identity = Some(identity.clone());

        match action.command {
            Some(Command::Send) => {
                identity.check_storable().map_err(TransferError::Protocol)?;
                match self
                    .shared
                    .registry
                    .acquire(&identity.key(), TransferStatus::Recv, self.id)
                {
                    Ok(lease) => {
                        self.lease = Some(lease);
                        self.receive_file(&identity, &action, rest).await
                    }
                    Err(status) => {
                        let err = self.conflict(&identity, status);
                        // best effort: the peer is already streaming and may not read this
                        let _ = self.reply(reply_info::IN_PROGRESS, status).await;
                        Err(err)
                    }
                }
            }
            Some(Command::Query) => {
                identity.check_storable().map_err(TransferError::Protocol)?;
                self.serve_query(&identity).await
            }
            Some(Command::Reply) => Err(TransferError::protocol("unexpected REPLY on an accepted connection")),
            None => Err(TransferError::protocol("handshake has no usable CMD")),
        }
    }

    async fn serve_query(&mut self, identity: &FileIdentity) -> Result<Outcome> {
        let key = identity.key();
        if let Some(status) = self.shared.registry.lookup(&key) {
            return self.reply(reply_info::NOT_READY, status).await;
        }
        let path = identity.storage_path(&self.shared.config.recv_dir);
        let exists = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !exists {
            return self.reply(reply_info::FILE_NOT_EXISTS, TransferStatus::Unknown).await;
        }
        match self.shared.registry.acquire(&key, TransferStatus::Send, self.id) {
            Ok(lease) => {
                info!(conn = %self.id, key = %key, "reply file");
                self.lease = Some(lease);
                let bytes = self.stream_file(&path, identity).await?;
                Ok(Outcome::Sent { bytes })
            }
            Err(status) => self.reply(reply_info::NOT_READY, status).await,
        }
    }

    async fn reply(&mut self, text: &str, status: TransferStatus) -> Result<Outcome> {
        self.transition(ConnState::Replying);
        let deadline = self.shared.config.handshake_timeout();
        write_action(self.stream_mut()?, &Action::reply(text, status), deadline).await?;
        Ok(Outcome::Reply {
            info: text.to_string(),
            status,
        })
    }

    async fn connect(&mut self) -> Result<()> {
        self.transition(ConnState::Connecting);
        let addr = self.shared.config.addr();
        info!(conn = %self.id, addr = %addr, "start connect");
        let deadline = self.shared.config.connect_timeout();
        let stream = with_deadline("connect", deadline, async {
            TcpStream::connect(&addr)
                .await
                .map_err(|source| TransferError::Connect {
                    addr: addr.clone(),
                    source,
                })
        })
        .await?;
        let _ = stream.set_nodelay(true);
        self.peer = stream.peer_addr().ok();
        self.stream = Some(stream);
        Ok(())
    }

    /// Announce the file with a SEND handshake and stream its bytes, then
    /// half-close so the peer sees the end of the bulk phase.
    async fn stream_file(&mut self, path: &Path, identity: &FileIdentity) -> Result<u64> {
        let shared = Arc::clone(&self.shared);
        let key = identity.key();
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let file = file.into_std().await;

        write_action(
            self.stream_mut()?,
            &Action::send(identity, len),
            shared.config.handshake_timeout(),
        )
        .await?;
        if self.state == ConnState::Connecting {
            self.transition(ConnState::HandshakeSent);
        }
        self.transition(ConnState::SendingFile);

        info!(conn = %self.id, key = %key, path = %path.display(), bytes = len, "send file");
        shared.logger.start(&key, Direction::Send, path);
        let progress = Progress::new(&key, len, Direction::Send, shared.logger.as_ref());
        let stream = self.stream_mut()?;
        let report = shared
            .strategy
            .send_file(stream, file, len, &progress, shared.config.idle_timeout())
            .await;
        let bytes = report.into_result(&key)?;
        stream.shutdown().await?;

        info!(conn = %self.id, key = %key, bytes, "send completed");
        shared.logger.complete(&key, Direction::Send, bytes);
        Ok(bytes)
    }

    async fn receive_file(&mut self, identity: &FileIdentity, action: &Action, prefix: Vec<u8>) -> Result<Outcome> {
        let shared = Arc::clone(&self.shared);
        self.transition(ConnState::ReceivingFile);

        let key = identity.key();
        let expected = action.size();
        let dir = shared.config.recv_dir.join(identity.kind());
        let path = identity.storage_path(&shared.config.recv_dir);
        shared.logger.start(&key, Direction::Recv, &path);

        let mut receiver = FileReceiver::new(dir, path);
        let progress = Progress::new(&key, expected, Direction::Recv, shared.logger.as_ref());
        let stream = self.stream_mut()?;
        let bytes = receiver
            .receive(stream, &prefix, &progress, shared.config.idle_timeout())
            .await?;

        if action.has_size() && expected == 0 {
            receiver.finish(true).await?;
        }
        if expected > 0 && bytes != expected {
            return Err(TransferError::Incomplete {
                key,
                transferred: receiver.received(),
                expected,
                reason: "peer closed with a byte count different from SIZE".to_string(),
            });
        }

        let path = receiver.path().to_path_buf();
        info!(conn = %self.id, key = %key, bytes, path = %path.display(), "recv completed");
        shared.logger.complete(&key, Direction::Recv, bytes);
        Ok(Outcome::Received { path, bytes })
    }

    fn conflict(&self, identity: &FileIdentity, status: TransferStatus) -> TransferError {
        let key = identity.key();
        warn!(conn = %self.id, key = %key, %status, "has pending task");
        self.shared.logger.rejected(&key, status);
        TransferError::Conflict { key, status }
    }

    async fn settle(&mut self, context: &str, res: Result<Outcome>) -> Result<Outcome> {
        if let Err(e) = &res {
            let key = self.key();
            error!(conn = %self.id, key = %key, peer = ?self.peer, "{}: {}", context, e);
            self.shared.logger.error(&key, context, &e.to_string());
        }
        self.close().await;
        res
    }

    /// Shut the socket down and release the registry entry. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        if let Some(lease) = self.lease.take() {
            debug!(conn = %self.id, key = lease.key(), status = %lease.status(), "task released");
        }
        self.transition(ConnState::Closed);
        info!(conn = %self.id, key = %self.key(), "connection shutdown");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnState::Closed {
            // cancelled mid-exchange; socket and lease are released with the fields
            debug!(conn = %self.id, state = ?self.state, "connection dropped before close");
            self.state = ConnState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ConnState::*;
        assert!(Init.can_become(Connecting));
        assert!(Init.can_become(HandshakeReceiving));
        assert!(Connecting.can_become(HandshakeSent));
        assert!(HandshakeSent.can_become(ReceivingFile));
        assert!(HandshakeReceiving.can_become(Replying));
        assert!(Replying.can_become(Closed));
        assert!(Init.can_become(Closed));

        assert!(!Closed.can_become(Init));
        assert!(!Closed.can_become(Closed));
        assert!(!Init.can_become(SendingFile));
        assert!(!HandshakeSent.can_become(Replying));
        assert!(!ReceivingFile.can_become(SendingFile));
    }
}
