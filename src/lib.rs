//! filetx - point-to-point file transfer over TCP
//!
//! A peer can push a file to another peer, or query whether a logical file
//! exists and receive it. Both roles share the same connection engine; the
//! only difference is which side listens.

pub mod action;
pub mod cli;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logger;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod streamer;

pub use config::{EngineConfig, Role};
pub use connection::Outcome;
pub use engine::{QueryTicket, TransferEngine, TransferHandle};
pub use error::{Result, TransferError};
pub use identity::FileIdentity;
pub use status::TransferStatus;
