//! Wire protocol shared by the server and client.
//!
//! Layers, bottom up: [`transport`] turns a TCP stream or WebSocket into
//! byte chunks, [`framing`] recovers length-delimited frames from them,
//! [`crypto`] and [`handshake`] establish the per-connection session key,
//! and [`codec`] turns frames into typed [`Packet`]s.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod packet;
pub mod transport;

pub use codec::{PacketCodec, MAX_PAYLOAD_LEN};
pub use crypto::{KeyEnvelope, Role, ServerIdentity, SessionKey};
pub use error::{CodecError, DecryptError, FramingError, HandshakeError, KeyLoadError};
pub use framing::{FrameDecoder, MAX_FRAME_LEN};
pub use handshake::HandshakeMessage;
pub use packet::{Packet, PacketCode};
pub use transport::{ChunkReader, ChunkWriter, FramedReader, TransportKind};

/// Protocol version exchanged in the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Current time in milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in milliseconds.
        assert!(timestamp_millis() > 1_577_836_800_000);
    }
}
