//! Packet codec: packet <-> encrypted frame.

use crate::crypto::{Role, SessionCipher, SessionKey, TAG_LEN};
use crate::error::CodecError;
use crate::framing::{encode_frame, MAX_FRAME_LEN};
use crate::packet::Packet;

/// Largest `[code][payload]` plaintext that still fits in one frame.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

/// Largest payload after the type code.
pub const MAX_PAYLOAD_LEN: usize = MAX_PLAINTEXT_LEN - 1;

/// Encrypts and frames outgoing packets, authenticates and parses incoming
/// frame bodies. One codec per connection; it owns the session key.
#[derive(Debug)]
pub struct PacketCodec {
    cipher: SessionCipher,
}

impl PacketCodec {
    pub fn new(key: SessionKey, role: Role) -> Self {
        Self {
            cipher: SessionCipher::new(key, role),
        }
    }

    pub fn key_fingerprint(&self) -> &str {
        self.cipher.key_fingerprint()
    }

    /// Produces the complete frame (length prefix included) for `packet`.
    pub fn encode(&mut self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let plaintext = packet.to_bytes()?;
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CodecError::PayloadTooLarge {
                len: plaintext.len() - 1,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let body = self.cipher.encrypt(&plaintext)?;
        Ok(encode_frame(&body)?)
    }

    /// Authenticates and parses one frame body as produced by the frame decoder.
    pub fn decode(&mut self, body: &[u8]) -> Result<Packet, CodecError> {
        let plaintext = self.cipher.decrypt(body)?;
        Packet::from_bytes(&plaintext)
    }
}
