//! Error types for the wire protocol.
//!
//! Each stage of the pipeline reports its own failure so that a connection
//! can be closed with a precise reason: framing problems, authentication
//! failures and unknown packet codes are never collapsed into one another.

use std::io;
use std::path::PathBuf;

/// Failure to load the server's long-lived key pair. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum KeyLoadError {
    #[error("key file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key file {path} is not valid base64: {reason}")]
    Encoding { path: PathBuf, reason: String },
    #[error("key file {path} holds {actual} bytes, expected {expected}")]
    Length {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

/// Errors from splitting a byte stream into frames.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("frame incomplete after read timeout ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("connection closed in the middle of a frame ({buffered} bytes buffered)")]
    ClosedMidFrame { buffered: usize },
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// The frame body failed authentication under the session key.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("frame body of {len} bytes is shorter than the authentication tag")]
    TooShort { len: usize },
    #[error("authentication failed for frame {counter}")]
    Authentication { counter: u64 },
    #[error("nonce counter exhausted")]
    CounterExhausted,
}

/// Errors from turning frames into packets and back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error("unknown packet type code 0x{0:02X}")]
    UnknownPacketCode(u8),
    #[error("empty packet body")]
    EmptyPacket,
    #[error("malformed payload for packet 0x{code:02X}: {reason}")]
    Malformed { code: u8, reason: String },
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Failure while establishing the session key.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake did not complete within {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("unexpected handshake message: expected {expected}")]
    Unexpected { expected: &'static str },
    #[error("protocol version mismatch: peer speaks {peer}, we speak {ours}")]
    VersionMismatch { ours: u16, peer: u16 },
    #[error("sealed session key failed to open")]
    SignatureMismatch,
    #[error("server public key does not match the pinned key")]
    ServerKeyMismatch,
    #[error("handshake rejected by peer: {0}")]
    Rejected(String),
    #[error("connection closed during handshake")]
    Closed,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
