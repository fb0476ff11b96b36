use shared::{CodecError, FramingError, HandshakeError};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("server closed the connection: {0}")]
    Disconnected(String),
    #[error("connection closed")]
    Closed,
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid server key: {0}")]
    InvalidServerKey(String),
}
