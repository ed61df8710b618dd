//! Handshake codec.
//!
//! A handshake is one ASCII message of the form
//! `CMD=<SEND|QUERY|REPLY>,K1=V1,K2=V2,...,;`. Every field is comma-terminated
//! and the message ends with a literal `;`. There is no escaping: `encode`
//! rejects values containing `,`, `=` or `;`, while `decode` takes whatever
//! tokens the separators produce.

use crate::error::{Result, TransferError};
use crate::identity::FileIdentity;
use crate::protocol::timeouts::with_deadline;
use crate::protocol::{keys, FIELD_SEP, KV_SEP, MAX_ACTION_LEN, RECV_CHUNK, TERMINATOR};
use crate::status::TransferStatus;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Send,
    Query,
    Reply,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Send => "SEND",
            Command::Query => "QUERY",
            Command::Reply => "REPLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEND" => Some(Command::Send),
            "QUERY" => Some(Command::Query),
            "REPLY" => Some(Command::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed handshake message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Action {
    /// `None` when `CMD` was missing or unrecognised
    pub command: Option<Command>,
    options: Vec<(String, String)>,
    size: u64,
}

impl Action {
    pub fn new(command: Command) -> Self {
        Self {
            command: Some(command),
            ..Self::default()
        }
    }

    pub fn send(identity: &FileIdentity, size: u64) -> Self {
        let mut a = Self::new(Command::Send);
        for (k, v) in identity.options() {
            a.set(k, v);
        }
        a.set(keys::SIZE, size.to_string());
        a.size = size;
        a
    }

    pub fn query(identity: &FileIdentity) -> Self {
        let mut a = Self::new(Command::Query);
        for (k, v) in identity.options() {
            a.set(k, v);
        }
        a
    }

    pub fn reply(info: &str, status: TransferStatus) -> Self {
        let mut a = Self::new(Command::Reply);
        a.set(keys::INFO, info);
        a.set(keys::STATUS, status.ordinal().to_string());
        a
    }

    /// Insert or overwrite an option, keeping first-seen order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.options.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// Advertised payload size of a SEND; 0 when absent or unparsable.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_size(&self) -> bool {
        self.get(keys::SIZE).is_some()
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity::from_action(self)
    }

    pub fn status(&self) -> TransferStatus {
        self.get(keys::STATUS)
            .map(TransferStatus::from_wire)
            .unwrap_or_default()
    }

    pub fn info(&self) -> &str {
        self.get(keys::INFO).unwrap_or_default()
    }

    pub fn encode(&self) -> Result<String> {
        let command = self
            .command
            .ok_or_else(|| TransferError::protocol("cannot encode an action without CMD"))?;
        let fields: Vec<(&str, &str)> = self
            .options
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        encode(command, &fields)
    }
}

fn check_token(s: &str) -> Result<()> {
    if s.contains([FIELD_SEP, KV_SEP, TERMINATOR]) {
        return Err(TransferError::protocol(format!(
            "value {:?} contains a reserved character",
            s
        )));
    }
    Ok(())
}

pub fn encode(command: Command, fields: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(64);
    out.push_str(keys::CMD);
    out.push(KV_SEP);
    out.push_str(command.as_str());
    out.push(FIELD_SEP);
    for (k, v) in fields {
        check_token(k)?;
        check_token(v)?;
        out.push_str(k);
        out.push(KV_SEP);
        out.push_str(v);
        out.push(FIELD_SEP);
    }
    out.push(TERMINATOR);
    Ok(out)
}

/// Parse a handshake message. Never fails: unusable tokens are skipped with a
/// warning and the caller decides whether the result carries enough fields.
pub fn decode(text: &str) -> Action {
    let mut action = Action::default();
    let terminator = TERMINATOR.to_string();
    for raw in text.split(FIELD_SEP) {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        // only a bare `;` field ends the message
        if token == terminator {
            break;
        }
        let mut parts = token.split(KV_SEP);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) => {
                let (k, v) = (k.trim(), v.trim());
                if k == keys::CMD {
                    action.command = Command::parse(v);
                    if action.command.is_none() {
                        warn!(cmd = v, "unknown command");
                    }
                } else {
                    action.set(k, v);
                }
            }
            _ => warn!(token, "invalid option"),
        }
    }
    if action.command == Some(Command::Send) {
        action.size = action
            .get(keys::SIZE)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
    }
    action
}

/// Read one handshake message, up to and including `;`.
///
/// Returns the decoded action and any bytes that arrived after the terminator;
/// those belong to the bulk payload that follows.
pub async fn read_action<S>(stream: &mut S, deadline: Option<Duration>) -> Result<(Action, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    with_deadline("handshake read", deadline, read_until_terminator(stream)).await
}

async fn read_until_terminator<S>(stream: &mut S) -> Result<(Action, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; RECV_CHUNK];
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == TERMINATOR as u8) {
            let rest = buf.split_off(pos + 1);
            let text = String::from_utf8_lossy(&buf);
            debug!(action = %text, "handshake received");
            return Ok((decode(&text), rest));
        }
        if buf.len() > MAX_ACTION_LEN {
            return Err(TransferError::protocol(format!(
                "handshake exceeds {} bytes without terminator",
                MAX_ACTION_LEN
            )));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransferError::protocol(
                "connection closed before handshake completed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn write_action<S>(stream: &mut S, action: &Action, deadline: Option<Duration>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let text = action.encode()?;
    debug!(action = %text, "handshake send");
    with_deadline("handshake write", deadline, async {
        stream.write_all(text.as_bytes()).await?;
        stream.flush().await?;
        Ok::<(), TransferError>(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_query_without_size() {
        let a = decode("CMD=QUERY,ID=a,TYPE=b,;");
        assert_eq!(a.command, Some(Command::Query));
        assert_eq!(a.get("ID"), Some("a"));
        assert_eq!(a.get("TYPE"), Some("b"));
        assert!(!a.has_size());
        assert_eq!(a.size(), 0);
    }

    #[test]
    fn test_malformed_token_does_not_stop_decoding() {
        let a = decode("CMD=SEND,FOO,ID=x,A=B=C,TYPE=ts,SIZE=12,;");
        assert_eq!(a.command, Some(Command::Send));
        assert_eq!(a.get("ID"), Some("x"));
        assert_eq!(a.get("TYPE"), Some("ts"));
        assert_eq!(a.get("FOO"), None);
        assert_eq!(a.get("A"), None);
        assert_eq!(a.size(), 12);
    }

    #[test]
    fn test_terminator_stops_parsing() {
        let a = decode("CMD=QUERY,ID=a,;,TYPE=b,");
        assert_eq!(a.get("ID"), Some("a"));
        assert_eq!(a.get("TYPE"), None);

        // a `;` inside a field is data, not the end of the message
        let b = decode("CMD=QUERY,ID=a;b,TYPE=t,;");
        assert_eq!(b.get("ID"), Some("a;b"));
        assert_eq!(b.get("TYPE"), Some("t"));

        let c = decode("CMD=QUERY,ID=a,  ;  ,TYPE=t,");
        assert_eq!(c.get("TYPE"), None);
    }

    #[test]
    fn test_size_missing_or_garbage_is_zero() {
        assert_eq!(decode("CMD=SEND,ID=a,;").size(), 0);
        assert_eq!(decode("CMD=SEND,SIZE=abc,;").size(), 0);
        assert_eq!(decode("CMD=SEND,SIZE=-5,;").size(), 0);
        assert_eq!(decode("CMD=SEND, SIZE = 100000 ,;").size(), 100000);
    }

    #[test]
    fn test_unknown_keys_are_kept() {
        let a = decode("CMD=QUERY,ID=a,COLOR=blue,;");
        assert_eq!(a.get("COLOR"), Some("blue"));
        assert_eq!(a.identity().id(), "a");
    }

    #[test]
    fn test_unknown_or_missing_command() {
        assert_eq!(decode("CMD=PUT,ID=a,;").command, None);
        assert_eq!(decode("ID=a,;").command, None);
        assert_eq!(decode("").command, None);
    }

    #[test]
    fn test_encode_grammar() {
        let id = FileIdentity::new("xiaomi", "ts", "20200606", "930", "1530");
        let text = Action::send(&id, 100000).encode().unwrap();
        assert_eq!(
            text,
            "CMD=SEND,ID=xiaomi,TYPE=ts,DATE=20200606,BEGIN=930,END=1530,SIZE=100000,;"
        );
        let text = Action::reply("file not exists", TransferStatus::Unknown)
            .encode()
            .unwrap();
        assert_eq!(text, "CMD=REPLY,INFO=file not exists,STATUS=0,;");
    }

    #[test]
    fn test_decoded_messages_encode_back_unchanged() {
        let ids = [
            FileIdentity::new("a1", "k", "20240101", "0900", "1000"),
            FileIdentity::new("xiaomi", "ts", "20200606", "930", "1530"),
            FileIdentity::new("dev-7", "raw.bin", "2021", "0", "2359"),
            FileIdentity::new("x", "y", "z", "1", "2"),
        ];
        for (n, id) in ids.iter().enumerate() {
            let mut send = Action::send(id, n as u64 * 1000 + 1);
            send.set("EXTRA", "kept");
            for wire in [send.encode().unwrap(), Action::query(id).encode().unwrap()] {
                let back = decode(&wire);
                assert_eq!(back.encode().unwrap(), wire);
                assert_eq!(back.identity(), *id);
            }
            let back = decode(&send.encode().unwrap());
            assert_eq!(back.size(), n as u64 * 1000 + 1);
            assert_eq!(back.get("EXTRA"), Some("kept"));
        }
    }

    #[test]
    fn test_encode_rejects_reserved_characters() {
        let bad = FileIdentity::new("a,b", "k", "d", "b", "e");
        assert!(Action::query(&bad).encode().is_err());
        assert!(encode(Command::Reply, &[("INFO", "x=y")]).is_err());
        assert!(encode(Command::Reply, &[("INFO", "x;")]).is_err());
    }

    #[tokio::test]
    async fn test_read_action_keeps_trailing_payload() {
        let wire = b"CMD=SEND,ID=a,TYPE=b,DATE=c,BEGIN=d,END=e,SIZE=5,;hello".to_vec();
        let mut cursor = std::io::Cursor::new(wire);
        let (action, rest) = read_action(&mut cursor, None).await.unwrap();
        assert_eq!(action.command, Some(Command::Send));
        assert_eq!(action.size(), 5);
        assert_eq!(rest, b"hello");
    }

    #[tokio::test]
    async fn test_read_action_eof_before_terminator() {
        let mut cursor = std::io::Cursor::new(b"CMD=QUERY,ID=a".to_vec());
        let err = read_action(&mut cursor, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_action_rejects_oversized_message() {
        let mut wire = b"CMD=QUERY,ID=".to_vec();
        wire.extend(std::iter::repeat(b'x').take(MAX_ACTION_LEN + 10));
        let mut cursor = std::io::Cursor::new(wire);
        let err = read_action(&mut cursor, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }
}
