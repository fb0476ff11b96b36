//! Cleartext handshake messages.
//!
//! ```text
//! Client                                   Server
//!   |------ ClientHello { version } -------->|
//!   |<----- ServerHello { public_key } ------|
//!   |------ KeyExchange { envelope } ------->|
//!   |                    [server opens envelope]
//!   |<===== HandshakeComplete (encrypted) ===|
//! ```
//!
//! Each message travels in its own frame. Nothing but the sealed envelope is
//! secret; everything after the exchange is encrypted by the packet codec.

use crate::crypto::{KeyEnvelope, KEY_LEN};
use crate::error::HandshakeError;
use crate::framing::encode_frame;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

/// Handshake messages are tiny; anything larger is not a handshake.
pub const MAX_HANDSHAKE_FRAME_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    ClientHello {
        version: u16,
    },
    ServerHello {
        version: u16,
        public_key: [u8; KEY_LEN],
    },
    KeyExchange {
        envelope: KeyEnvelope,
    },
    Rejected {
        reason: String,
    },
}

impl HandshakeMessage {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::ClientHello { .. } => "ClientHello",
            HandshakeMessage::ServerHello { .. } => "ServerHello",
            HandshakeMessage::KeyExchange { .. } => "KeyExchange",
            HandshakeMessage::Rejected { .. } => "Rejected",
        }
    }

    /// Serializes into a complete frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, HandshakeError> {
        let body = serialize(self).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        Ok(encode_frame(&body)?)
    }

    pub fn from_body(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() > MAX_HANDSHAKE_FRAME_LEN {
            return Err(HandshakeError::Malformed(format!(
                "{} byte handshake frame",
                body.len()
            )));
        }
        deserialize(body).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}
