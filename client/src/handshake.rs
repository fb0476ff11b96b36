//! Client side of the key-exchange handshake.

use log::debug;
use shared::crypto::{Role, KEY_LEN};
use shared::{
    ChunkWriter, FramedReader, FramingError, HandshakeError, HandshakeMessage, Packet,
    PacketCodec, SessionKey, PROTOCOL_VERSION,
};

/// Result of a completed handshake.
pub struct Negotiated {
    pub codec: PacketCodec,
    pub server_key: [u8; KEY_LEN],
}

/// Sends the hello, seals a fresh session key for the server and waits for
/// the encrypted acknowledgement.
///
/// With `pinned` set, a server presenting any other public key is refused
/// before the session key is sent.
pub async fn client_handshake(
    reader: &mut FramedReader,
    writer: &mut ChunkWriter,
    pinned: Option<[u8; KEY_LEN]>,
) -> Result<Negotiated, HandshakeError> {
    send(
        writer,
        &HandshakeMessage::ClientHello {
            version: PROTOCOL_VERSION,
        },
    )
    .await?;

    let server_key = match receive(reader).await? {
        HandshakeMessage::ServerHello {
            version,
            public_key,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(HandshakeError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    peer: version,
                });
            }
            public_key
        }
        HandshakeMessage::Rejected { reason } => return Err(HandshakeError::Rejected(reason)),
        _ => {
            return Err(HandshakeError::Unexpected {
                expected: "ServerHello",
            })
        }
    };
    if pinned.map_or(false, |pinned| pinned != server_key) {
        return Err(HandshakeError::ServerKeyMismatch);
    }

    let key = SessionKey::generate();
    let envelope = key.seal(&server_key)?;
    send(writer, &HandshakeMessage::KeyExchange { envelope }).await?;

    let mut codec = PacketCodec::new(key, Role::Client);
    let body = reader.next_frame().await?.ok_or(HandshakeError::Closed)?;
    match codec.decode(&body)? {
        Packet::HandshakeComplete => {}
        _ => {
            return Err(HandshakeError::Unexpected {
                expected: "HandshakeComplete",
            })
        }
    }

    debug!("Session key {} accepted", codec.key_fingerprint());
    Ok(Negotiated { codec, server_key })
}

async fn receive(reader: &mut FramedReader) -> Result<HandshakeMessage, HandshakeError> {
    match reader.next_frame().await? {
        Some(body) => HandshakeMessage::from_body(&body),
        None => Err(HandshakeError::Closed),
    }
}

async fn send(writer: &mut ChunkWriter, message: &HandshakeMessage) -> Result<(), HandshakeError> {
    writer
        .write_chunk(message.to_frame()?)
        .await
        .map_err(FramingError::from)?;
    Ok(())
}
