//! Per-connection pipeline: upgrade, handshake, slot allocation, then the
//! packet loop until either side ends the session.
//!
//! One task owns everything about a connection (codec, reader, writer), so
//! the cipher counters never need sharing. Other tasks reach it only through
//! its [`SessionHandle`].

use crate::context::ServerContext;
use crate::dispatcher::{Dispatcher, Flow, HandlerContext};
use crate::error::ConnectionError;
use crate::handshake::perform_handshake;
use crate::listener::open_transport;
use crate::registry::{
    next_connection_id, ConnectionId, NewSession, Outbound, SessionHandle, SessionMailbox, SlotId,
};
use log::{debug, info, warn};
use shared::{
    ChunkReader, ChunkWriter, FramedReader, HandshakeError, Packet, PacketCodec, ServerIdentity,
    TransportKind,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

pub const PROTOCOL_VIOLATION: &str = "Protocol violation";
pub const SHUTTING_DOWN: &str = "Server is shutting down";

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Covers the WebSocket upgrade and the key exchange together.
    pub handshake_timeout: Duration,
    /// Bounds finishing a partly received frame, and each outbound write.
    pub frame_timeout: Duration,
}

/// Everything a connection task needs from the server.
pub struct Pipeline {
    pub context: Arc<ServerContext>,
    pub identity: Arc<ServerIdentity>,
    pub dispatcher: Arc<Dispatcher>,
    pub settings: ConnectionSettings,
}

/// Serves one accepted socket to completion. Errors end this connection
/// only and are logged with the remote address.
pub async fn handle_connection(
    pipeline: Arc<Pipeline>,
    kind: TransportKind,
    stream: TcpStream,
    addr: SocketAddr,
) {
    match serve(&pipeline, kind, stream, addr).await {
        Ok(()) => debug!("Connection from {} ({}) finished", addr, kind),
        Err(e) => warn!("Connection from {} ({}) closed: {}", addr, kind, e),
    }
}

async fn serve(
    pipeline: &Pipeline,
    kind: TransportKind,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ConnectionError> {
    let budget = pipeline.settings.handshake_timeout;
    let deadline = Instant::now() + budget;

    let (reader, writer) = tokio::time::timeout_at(deadline, open_transport(kind, stream))
        .await
        .map_err(|_| ConnectionError::from(HandshakeError::Timeout(budget)))??;
    serve_transport(pipeline, kind, reader, writer, addr, deadline).await
}

/// Everything after the transport is open. `deadline` bounds the key
/// exchange.
async fn serve_transport(
    pipeline: &Pipeline,
    kind: TransportKind,
    reader: ChunkReader,
    mut writer: ChunkWriter,
    addr: SocketAddr,
    deadline: Instant,
) -> Result<(), ConnectionError> {
    let write_limit = pipeline.settings.frame_timeout;
    let mut reader = FramedReader::new(reader, pipeline.settings.frame_timeout);

    let remaining = deadline.saturating_duration_since(Instant::now());
    let handshake = perform_handshake(&mut reader, &mut writer, &pipeline.identity, remaining).await;
    let mut codec = match handshake {
        Ok(codec) => codec,
        Err(e) => {
            close_writer(&mut writer, write_limit).await;
            return Err(e.into());
        }
    };

    if pipeline.context.is_shutting_down() {
        farewell(&mut writer, &mut codec, SHUTTING_DOWN, write_limit).await?;
        return Ok(());
    }

    let (handle, mailbox) = SessionHandle::new();
    let connection_id = next_connection_id();
    let allocated = pipeline.context.registry.allocate(NewSession {
        connection_id,
        kind,
        addr,
        key_fingerprint: codec.key_fingerprint().to_string(),
        handle: handle.clone(),
    });
    let slot = match allocated {
        Ok(slot) => slot,
        Err(full) => {
            let _ = farewell(&mut writer, &mut codec, &full.to_string(), write_limit).await;
            return Err(full.into());
        }
    };

    // Shutdown raises its flag before sweeping the registry, so a session
    // allocated after the sweep always sees the flag here.
    if pipeline.context.is_shutting_down() {
        pipeline.context.registry.release(slot, connection_id);
        farewell(&mut writer, &mut codec, SHUTTING_DOWN, write_limit).await?;
        return Ok(());
    }

    let mut live = LiveConnection {
        pipeline,
        slot,
        connection_id,
        addr,
        handle,
        mailbox,
        reader,
        writer,
        codec,
    };
    let result = live.run().await;
    close_writer(&mut live.writer, write_limit).await;

    // Saves the character first; a no-op if an operator already ended it.
    pipeline.context.end_session(slot, connection_id, None);
    result
}

/// Writes one frame. A peer that has not taken it within `limit` has
/// stopped reading and the connection is given up.
async fn write_frame(
    writer: &mut ChunkWriter,
    frame: Vec<u8>,
    limit: Duration,
) -> Result<(), ConnectionError> {
    match tokio::time::timeout(limit, writer.write_chunk(frame)).await {
        Ok(written) => Ok(written?),
        Err(_) => Err(ConnectionError::WriteStalled(limit)),
    }
}

async fn close_writer(writer: &mut ChunkWriter, limit: Duration) {
    if tokio::time::timeout(limit, writer.close()).await.is_err() {
        debug!("Transport close stalled, dropping it");
    }
}

/// Encrypts and writes a final `Disconnected`, then closes the transport.
async fn farewell(
    writer: &mut ChunkWriter,
    codec: &mut PacketCodec,
    reason: &str,
    limit: Duration,
) -> Result<(), ConnectionError> {
    let frame = codec.encode(&Packet::Disconnected {
        reason: reason.to_string(),
    })?;
    let sent = write_frame(writer, frame, limit).await;
    close_writer(writer, limit).await;
    sent
}

struct LiveConnection<'a> {
    pipeline: &'a Pipeline,
    slot: SlotId,
    connection_id: ConnectionId,
    addr: SocketAddr,
    handle: SessionHandle,
    mailbox: SessionMailbox,
    reader: FramedReader,
    writer: ChunkWriter,
    codec: PacketCodec,
}

impl LiveConnection<'_> {
    async fn run(&mut self) -> Result<(), ConnectionError> {
        self.send(&Packet::Joined { slot: self.slot }).await?;

        loop {
            // Outbound first: replies queued by a handler go out before the
            // next inbound frame is read.
            tokio::select! {
                biased;

                outbound = self.mailbox.outbox.recv() => match outbound {
                    Some(Outbound::Packet(packet)) => self.send(&packet).await?,
                    Some(Outbound::Close(reason)) => {
                        info!("Closing session {} ({}): {}", self.slot, self.addr, reason);
                        let limit = self.write_limit();
                        return farewell(
                            &mut self.writer,
                            &mut self.codec,
                            &reason,
                            limit,
                        )
                        .await;
                    }
                    None => return Ok(()),
                },
                frame = self.reader.next_frame() => match frame? {
                    Some(body) => {
                        if let Err(e) = self.handle_frame(&body) {
                            self.handle.close(PROTOCOL_VIOLATION);
                            let limit = self.write_limit();
                            let _ =
                                farewell(&mut self.writer, &mut self.codec, PROTOCOL_VIOLATION, limit)
                                    .await;
                            return Err(e);
                        }
                    }
                    None => {
                        debug!("{} closed the connection", self.addr);
                        return Ok(());
                    }
                },
            }
        }
    }

    fn handle_frame(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let packet = self.codec.decode(body)?;
        self.pipeline
            .context
            .registry
            .touch(self.slot, self.connection_id);

        let ctx = HandlerContext {
            server: &self.pipeline.context,
            slot: self.slot,
            connection_id: self.connection_id,
            addr: self.addr,
            handle: &self.handle,
        };
        match self.pipeline.dispatcher.dispatch(&ctx, packet)? {
            Flow::Continue => {}
            // Queued behind any replies the handler produced.
            Flow::Close(reason) => self.handle.close(reason),
        }
        Ok(())
    }

    fn write_limit(&self) -> Duration {
        self.pipeline.settings.frame_timeout
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let frame = self.codec.encode(packet)?;
        let limit = self.write_limit();
        write_frame(&mut self.writer, frame, limit).await
    }
}
