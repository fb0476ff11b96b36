use crate::error::ClientError;
use crate::handshake::{client_handshake, Negotiated};
use log::{debug, info, warn};
use shared::crypto::KEY_LEN;
use shared::transport::{split_stream, split_websocket};
use shared::{timestamp_millis, ChunkWriter, FramedReader, Packet, PacketCodec, TransportKind};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Refuse any server whose public key differs from this one.
    pub pinned_key: Option<[u8; KEY_LEN]>,
    /// Bound on connecting, upgrading and the key exchange together.
    pub timeout: Duration,
    pub frame_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            pinned_key: None,
            timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(10),
        }
    }
}

/// What the server told us when it accepted a login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginInfo {
    pub power: i32,
    pub muted: bool,
}

/// A connected, keyed client holding a server slot.
pub struct GameClient {
    reader: FramedReader,
    writer: ChunkWriter,
    codec: PacketCodec,
    slot: u32,
    server_key: [u8; KEY_LEN],
    /// Packets read while waiting for something else.
    pending: VecDeque<Packet>,
}

impl GameClient {
    /// Connects over `kind`, runs the handshake and waits for the slot
    /// assignment.
    pub async fn connect(
        addr: &str,
        kind: TransportKind,
        options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        tokio::time::timeout(options.timeout, Self::establish(addr, kind, &options))
            .await
            .map_err(|_| ClientError::Timeout("handshake"))?
    }

    async fn establish(
        addr: &str,
        kind: TransportKind,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        let connect_error = |source: io::Error| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };

        let (reader, mut writer) = match kind {
            TransportKind::Stream => {
                let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
                stream.set_nodelay(true)?;
                split_stream(stream)
            }
            TransportKind::WebSocket => {
                let url = format!("ws://{}", addr);
                let (socket, _) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| connect_error(io::Error::new(io::ErrorKind::Other, e)))?;
                split_websocket(socket)
            }
        };
        let mut reader = FramedReader::new(reader, options.frame_timeout);

        let Negotiated { codec, server_key } =
            client_handshake(&mut reader, &mut writer, options.pinned_key).await?;

        let mut client = Self {
            reader,
            writer,
            codec,
            slot: 0,
            server_key,
            pending: VecDeque::new(),
        };
        client.slot = match client.read_packet().await? {
            Packet::Joined { slot } => slot,
            Packet::Disconnected { reason } => return Err(ClientError::Disconnected(reason)),
            other => {
                warn!("Expected Joined, got {:?}", other.code());
                return Err(ClientError::Disconnected(format!(
                    "unexpected {:?} before slot assignment",
                    other.code()
                )));
            }
        };

        info!(
            "Connected to {} over {} in slot {} (key {})",
            addr,
            kind,
            client.slot,
            client.codec.key_fingerprint()
        );
        Ok(client)
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn key_fingerprint(&self) -> &str {
        self.codec.key_fingerprint()
    }

    pub fn server_key(&self) -> [u8; KEY_LEN] {
        self.server_key
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let frame = self.codec.encode(packet)?;
        self.writer.write_chunk(frame).await?;
        Ok(())
    }

    /// Next packet from the server.
    pub async fn recv(&mut self) -> Result<Packet, ClientError> {
        match self.pending.pop_front() {
            Some(packet) => Ok(packet),
            None => self.read_packet().await,
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Packet, ClientError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ClientError::Timeout("packet"))?
    }

    async fn read_packet(&mut self) -> Result<Packet, ClientError> {
        let body = self.reader.next_frame().await?.ok_or(ClientError::Closed)?;
        let packet = self.codec.decode(&body)?;
        debug!("Received {:?}", packet.code());
        Ok(packet)
    }

    /// Reads until `select` accepts a packet, keeping everything else for
    /// later [`GameClient::recv`] calls. A `Disconnected` ends the wait.
    async fn wait_for<T>(
        &mut self,
        mut select: impl FnMut(&Packet) -> Option<T>,
    ) -> Result<T, ClientError> {
        loop {
            let packet = self.read_packet().await?;
            if let Some(value) = select(&packet) {
                return Ok(value);
            }
            if let Packet::Disconnected { reason } = packet {
                return Err(ClientError::Disconnected(reason));
            }
            self.pending.push_back(packet);
        }
    }

    pub async fn login(&mut self, account: &str) -> Result<LoginInfo, ClientError> {
        self.send(&Packet::Login {
            account: account.to_string(),
        })
        .await?;

        let reply = self
            .wait_for(|packet| match packet {
                Packet::LoginAccepted { power, muted } => Some(Ok(LoginInfo {
                    power: *power,
                    muted: *muted,
                })),
                Packet::LoginRejected { reason } => Some(Err(reason.clone())),
                _ => None,
            })
            .await?;
        reply.map_err(ClientError::LoginRejected)
    }

    pub async fn select_character(&mut self, name: &str) -> Result<String, ClientError> {
        self.send(&Packet::CharacterSelect {
            name: name.to_string(),
        })
        .await?;

        self.wait_for(|packet| match packet {
            Packet::CharacterLoaded { name } => Some(name.clone()),
            _ => None,
        })
        .await
    }

    /// Round-trip time of one heartbeat.
    pub async fn heartbeat(&mut self) -> Result<Duration, ClientError> {
        let sent = timestamp_millis();
        self.send(&Packet::Heartbeat { timestamp: sent }).await?;

        self.wait_for(|packet| match packet {
            Packet::HeartbeatAck { timestamp } if *timestamp == sent => Some(()),
            _ => None,
        })
        .await?;
        Ok(Duration::from_millis(timestamp_millis().saturating_sub(sent)))
    }

    /// Logs out and waits for the server's goodbye.
    pub async fn logout(mut self) -> Result<String, ClientError> {
        self.send(&Packet::Logout).await?;
        loop {
            match self.read_packet().await {
                Ok(Packet::Disconnected { reason }) => {
                    self.writer.close().await;
                    return Ok(reason);
                }
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops the connection without saying goodbye.
    pub async fn close(mut self) {
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::Role;
    use shared::{HandshakeError, HandshakeMessage, ServerIdentity};
    use tokio::net::TcpListener;

    /// Accepts one connection, performs the server half of the handshake
    /// by hand and sends `after` once keyed.
    async fn one_shot_server(
        identity: ServerIdentity,
        after: Vec<Packet>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = split_stream(stream);
            let mut reader = FramedReader::new(reader, Duration::from_secs(1));

            let body = reader.next_frame().await.unwrap().unwrap();
            assert!(matches!(
                HandshakeMessage::from_body(&body).unwrap(),
                HandshakeMessage::ClientHello { .. }
            ));
            let hello = HandshakeMessage::ServerHello {
                version: shared::PROTOCOL_VERSION,
                public_key: identity.public_key(),
            };
            writer.write_chunk(hello.to_frame().unwrap()).await.unwrap();

            // A client that refused our key hangs up here.
            let Ok(Some(body)) = reader.next_frame().await else {
                return;
            };
            let envelope = match HandshakeMessage::from_body(&body).unwrap() {
                HandshakeMessage::KeyExchange { envelope } => envelope,
                other => panic!("Expected KeyExchange, got {:?}", other),
            };
            let key = identity.open(&envelope).unwrap();
            let mut codec = PacketCodec::new(key, Role::Server);

            for packet in std::iter::once(Packet::HandshakeComplete).chain(after) {
                writer
                    .write_chunk(codec.encode(&packet).unwrap())
                    .await
                    .unwrap();
            }
            // Keep the socket open until the client is done.
            let _ = reader.next_frame().await;
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_connect_receives_slot() {
        let identity = ServerIdentity::generate();
        let public_key = identity.public_key();
        let (addr, _server) = one_shot_server(identity, vec![Packet::Joined { slot: 3 }]).await;

        let options = ConnectOptions {
            pinned_key: Some(public_key),
            ..ConnectOptions::default()
        };
        let client = GameClient::connect(&addr, TransportKind::Stream, options)
            .await
            .unwrap();
        assert_eq!(client.slot(), 3);
        assert_eq!(client.server_key(), public_key);
        assert_eq!(client.key_fingerprint().len(), 16);
    }

    #[tokio::test]
    async fn test_pinned_key_mismatch_is_refused() {
        let identity = ServerIdentity::generate();
        let (addr, server) = one_shot_server(identity, Vec::new()).await;

        let options = ConnectOptions {
            pinned_key: Some(ServerIdentity::generate().public_key()),
            ..ConnectOptions::default()
        };
        let result = GameClient::connect(&addr, TransportKind::Stream, options).await;
        assert!(matches!(
            result,
            Err(ClientError::Handshake(HandshakeError::ServerKeyMismatch))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_server_is_reported() {
        let identity = ServerIdentity::generate();
        let (addr, _server) = one_shot_server(
            identity,
            vec![Packet::Disconnected {
                reason: "server is full".into(),
            }],
        )
        .await;

        let result =
            GameClient::connect(&addr, TransportKind::Stream, ConnectOptions::default()).await;
        assert!(matches!(
            result,
            Err(ClientError::Disconnected(reason)) if reason == "server is full"
        ));
    }

    #[tokio::test]
    async fn test_unrelated_packets_are_kept_during_login() {
        let identity = ServerIdentity::generate();
        let (addr, _server) = one_shot_server(
            identity,
            vec![
                Packet::Joined { slot: 0 },
                Packet::GlobalMessage {
                    message: "welcome".into(),
                },
                Packet::LoginAccepted {
                    power: 1,
                    muted: false,
                },
            ],
        )
        .await;

        let mut client =
            GameClient::connect(&addr, TransportKind::Stream, ConnectOptions::default())
                .await
                .unwrap();
        let info = client.login("alice").await.unwrap();
        assert_eq!(
            info,
            LoginInfo {
                power: 1,
                muted: false
            }
        );
        assert_eq!(
            client.recv().await.unwrap(),
            Packet::GlobalMessage {
                message: "welcome".into()
            }
        );
    }
}
