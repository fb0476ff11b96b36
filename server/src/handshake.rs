//! Server side of the key-exchange handshake.

use log::debug;
use shared::crypto::Role;
use shared::{
    ChunkWriter, FramedReader, FramingError, HandshakeError, HandshakeMessage, Packet,
    PacketCodec, ServerIdentity, PROTOCOL_VERSION,
};
use std::time::Duration;

/// Runs the handshake on a fresh transport and returns the connection's
/// codec once the client's session key has been adopted and acknowledged.
///
/// The whole exchange must finish within `timeout`. On any error the caller
/// closes the transport; nothing has been registered yet.
pub async fn perform_handshake(
    reader: &mut FramedReader,
    writer: &mut ChunkWriter,
    identity: &ServerIdentity,
    timeout: Duration,
) -> Result<PacketCodec, HandshakeError> {
    tokio::time::timeout(timeout, exchange(reader, writer, identity))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn exchange(
    reader: &mut FramedReader,
    writer: &mut ChunkWriter,
    identity: &ServerIdentity,
) -> Result<PacketCodec, HandshakeError> {
    let version = match receive(reader).await? {
        HandshakeMessage::ClientHello { version } => version,
        _ => return Err(HandshakeError::Unexpected {
            expected: "ClientHello",
        }),
    };
    if version != PROTOCOL_VERSION {
        let rejection = HandshakeMessage::Rejected {
            reason: format!("Unsupported protocol version {}", version),
        };
        let _ = send(writer, &rejection).await;
        return Err(HandshakeError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            peer: version,
        });
    }

    send(
        writer,
        &HandshakeMessage::ServerHello {
            version: PROTOCOL_VERSION,
            public_key: identity.public_key(),
        },
    )
    .await?;

    let envelope = match receive(reader).await? {
        HandshakeMessage::KeyExchange { envelope } => envelope,
        _ => return Err(HandshakeError::Unexpected {
            expected: "KeyExchange",
        }),
    };
    let key = identity.open(&envelope)?;

    let mut codec = PacketCodec::new(key, Role::Server);
    let ack = codec.encode(&Packet::HandshakeComplete)?;
    writer.write_chunk(ack).await.map_err(FramingError::from)?;

    debug!("Handshake complete, session key {}", codec.key_fingerprint());
    Ok(codec)
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
