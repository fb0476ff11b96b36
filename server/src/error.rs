//! Server-side error taxonomy.
//!
//! Startup errors ([`BindError`], [`ConfigError`], key loading) are fatal.
//! Everything scoped to one connection ends up in a [`ConnectionError`] that
//! is logged and closes that connection only. Console errors never change
//! state.

use crate::registry::SlotId;
use shared::{CodecError, FramingError, HandshakeError, KeyLoadError, PacketCode, TransportKind};
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[error("failed to bind {kind} listener on {addr}: {source}")]
pub struct BindError {
    pub kind: TransportKind,
    pub addr: String,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {path} is invalid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The registry is full; the new connection is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("server is full ({max} sessions)")]
pub struct CapacityExceeded {
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("no such account: {0}")]
    UnknownAccount(String),
}

/// A handler refused a packet. All of these are protocol violations and
/// close the connection.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0:?} requires a completed login")]
    NotLoggedIn(PacketCode),
    #[error("{0:?} requires an active character")]
    NoCharacter(PacketCode),
    #[error("session already logged in")]
    AlreadyLoggedIn,
    #[error("slot {0} is no longer active")]
    SessionGone(SlotId),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {0:?}")]
    UnknownPacketCode(PacketCode),
    #[error("a handler for {0:?} is already registered")]
    DuplicateHandler(PacketCode),
    #[error("handler for {code:?} failed: {source}")]
    Handler {
        code: PacketCode,
        #[source]
        source: HandlerError,
    },
}

/// Operator console failures. Reported to the console only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("invalid arguments for {command}: {reason}")]
    Arguments {
        command: &'static str,
        reason: String,
    },
    #[error("player {0} is not online")]
    TargetNotFound(String),
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Why a connection ended. Only used for logging.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("peer stopped reading, write stalled for {0:?}")]
    WriteStalled(std::time::Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    KeyLoad(#[from] KeyLoadError),
    #[error(transparent)]
    Bind(#[from] BindError),
}
