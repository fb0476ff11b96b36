//! Transport listeners.
//!
//! Both transports accept plain TCP. A WebSocket listener additionally runs
//! the HTTP upgrade before the connection is handed to the pipeline, so the
//! handshake and everything after it only ever see a chunk reader/writer.

use crate::error::BindError;
use log::info;
use shared::transport::{split_stream, split_websocket};
use shared::{ChunkReader, ChunkWriter, TransportKind};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

pub struct Listener {
    kind: TransportKind,
    inner: TcpListener,
}

impl Listener {
    /// Binds the listening socket. Failure here is fatal to startup.
    pub async fn bind(kind: TransportKind, addr: &str) -> Result<Self, BindError> {
        let inner = TcpListener::bind(addr).await.map_err(|source| BindError {
            kind,
            addr: addr.to_string(),
            source,
        })?;

        let local = inner.local_addr().map_err(|source| BindError {
            kind,
            addr: addr.to_string(),
            source,
        })?;
        info!("{} listener bound on {}", kind, local);

        Ok(Self { kind, inner })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

/// Turns an accepted socket into transport halves, running the WebSocket
/// upgrade where needed.
pub async fn open_transport(
    kind: TransportKind,
    stream: TcpStream,
) -> io::Result<(ChunkReader, ChunkWriter)> {
    stream.set_nodelay(true)?;
    match kind {
        TransportKind::Stream => Ok(split_stream(stream)),
        TransportKind::WebSocket => {
            let socket = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(split_websocket(socket))
        }
    }
}
