//! Transfer status values shared by the registry and the REPLY message.

use std::fmt;

/// State of a logical file transfer.
///
/// Ordinals are the wire encoding of `STATUS=` in a REPLY and must stay stable.
/// Registry lookups never return `Unknown`; absence is `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TransferStatus {
    #[default]
    Unknown = 0,
    NotExists = 1,
    Query = 2,
    Recv = 3,
    Send = 4,
    Abort = 5,
    Ready = 6,
}

impl TransferStatus {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Unknown,
            1 => Self::NotExists,
            2 => Self::Query,
            3 => Self::Recv,
            4 => Self::Send,
            5 => Self::Abort,
            6 => Self::Ready,
            _ => return None,
        })
    }

    /// Parse a `STATUS=` value; anything unrecognised maps to `Unknown`.
    pub fn from_wire(s: &str) -> Self {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(Self::from_ordinal)
            .unwrap_or(Self::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::NotExists => "NOT_EXISTS",
            Self::Query => "QUERY",
            Self::Recv => "RECV",
            Self::Send => "SEND",
            Self::Abort => "ABORT",
            Self::Ready => "READY",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
