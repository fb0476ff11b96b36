//! Byte transports underneath the framing layer.
//!
//! A connection is either a raw byte stream (TCP) or a WebSocket carrying
//! binary messages. Both are reduced to the same pair of halves: a
//! [`ChunkReader`] yielding whatever chunks the transport delivers and a
//! [`ChunkWriter`] accepting complete frames. Message boundaries on the
//! WebSocket side carry no meaning; frames are always recovered from the
//! length prefix.

use crate::error::FramingError;
use crate::framing::FrameDecoder;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

const READ_CHUNK_LEN: usize = 8 * 1024;

/// Which kind of listener accepted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "tcp"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;
type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of a transport.
pub enum ChunkReader {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    WebSocket(WsSource),
}

/// Write half of a transport.
pub enum ChunkWriter {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    WebSocket(WsSink),
}

/// Splits a raw byte stream into transport halves.
pub fn split_stream<S>(stream: S) -> (ChunkReader, ChunkWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        ChunkReader::Stream(Box::new(read_half)),
        ChunkWriter::Stream(Box::new(write_half)),
    )
}

/// Splits an established WebSocket into transport halves.
pub fn split_websocket<S>(socket: WebSocketStream<S>) -> (ChunkReader, ChunkWriter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = socket.split();
    (
        ChunkReader::WebSocket(Box::pin(source)),
        ChunkWriter::WebSocket(Box::pin(sink)),
    )
}

fn ws_to_io(error: WsError) -> io::Error {
    match error {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::ConnectionReset, "websocket closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl ChunkReader {
    pub fn kind(&self) -> TransportKind {
        match self {
            ChunkReader::Stream(_) => TransportKind::Stream,
            ChunkReader::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    /// Next chunk of bytes, or `None` once the peer has closed.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            ChunkReader::Stream(reader) => {
                let mut buf = vec![0u8; READ_CHUNK_LEN];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
            ChunkReader::WebSocket(source) => loop {
                match source.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(ws_to_io(e)),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Text(_))) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "text message on a binary protocol",
                        ))
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                }
            },
        }
    }
}

impl ChunkWriter {
    pub fn kind(&self) -> TransportKind {
        match self {
            ChunkWriter::Stream(_) => TransportKind::Stream,
            ChunkWriter::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    /// Writes one complete frame.
    pub async fn write_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        match self {
            ChunkWriter::Stream(writer) => {
                writer.write_all(&chunk).await?;
                writer.flush().await
            }
            ChunkWriter::WebSocket(sink) => sink.send(Message::binary(chunk)).await.map_err(ws_to_io),
        }
    }

    /// Closes the transport. Errors are ignored; the peer may already be gone.
    pub async fn close(&mut self) {
        match self {
            ChunkWriter::Stream(writer) => {
                let _ = writer.shutdown().await;
            }
            ChunkWriter::WebSocket(sink) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }
}

/// Frame reader with a bound on how long a started frame may take to finish.
///
/// Waiting for the *first* byte of a frame is unbounded (idle detection is
/// the registry's job). Once part of a frame is buffered, the rest must
/// arrive within `frame_timeout` or the read fails with
/// [`FramingError::Truncated`].
pub struct FramedReader {
    reader: ChunkReader,
    decoder: FrameDecoder,
    frame_timeout: Duration,
    partial_deadline: Option<Instant>,
}

impl FramedReader {
    pub fn new(reader: ChunkReader, frame_timeout: Duration) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            frame_timeout,
            partial_deadline: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.reader.kind()
    }

    /// Next complete frame body, or `None` on a clean close between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            if let Some(body) = self.decoder.next_frame()? {
                self.partial_deadline = None;
                return Ok(Some(body));
            }

            let chunk = if self.decoder.has_partial() {
                let deadline = *self
                    .partial_deadline
                    .get_or_insert_with(|| Instant::now() + self.frame_timeout);
                match tokio::time::timeout_at(deadline, self.reader.read_chunk()).await {
                    Ok(chunk) => chunk?,
                    Err(_) => {
                        return Err(FramingError::Truncated {
                            buffered: self.decoder.buffered(),
                        })
                    }
                }
            } else {
                self.reader.read_chunk().await?
            };

            match chunk {
                Some(bytes) => self.decoder.extend(&bytes),
                None if self.decoder.has_partial() => {
                    return Err(FramingError::ClosedMidFrame {
                        buffered: self.decoder.buffered(),
                    })
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_stream_frames_across_chunks() {
        let mut wire = encode_frame(b"one").unwrap();
        wire.extend(encode_frame(b"two").unwrap());
        let (first, rest) = wire.split_at(5);

        let mock = tokio_test::io::Builder::new()
            .read(first)
            .read(rest)
            .build();
        let (reader, _writer) = split_stream(mock);
        let mut framed = FramedReader::new(reader, Duration::from_secs(1));

        assert_eq!(framed.next_frame().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(framed.next_frame().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(framed.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_frame_times_out() {
        let (local, mut remote) = duplex(1024);
        let (reader, _writer) = split_stream(local);
        let mut framed = FramedReader::new(reader, Duration::from_millis(50));

        let frame = encode_frame(b"never finished").unwrap();
        remote.write_all(&frame[..6]).await.unwrap();

        match framed.next_frame().await {
            Err(FramingError::Truncated { buffered }) => assert_eq!(buffered, 6),
            other => panic!("Expected truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_between_frames_is_not_an_error() {
        let (local, mut remote) = duplex(1024);
        let (reader, _writer) = split_stream(local);
        let mut framed = FramedReader::new(reader, Duration::from_millis(20));

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            remote.write_all(&encode_frame(b"late").unwrap()).await.unwrap();
            remote
        });

        assert_eq!(framed.next_frame().await.unwrap(), Some(b"late".to_vec()));
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_mid_frame() {
        let (local, mut remote) = duplex(1024);
        let (reader, _writer) = split_stream(local);
        let mut framed = FramedReader::new(reader, Duration::from_secs(5));

        remote.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(remote);

        assert!(matches!(
            framed.next_frame().await,
            Err(FramingError::ClosedMidFrame { buffered: 6 })
        ));
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let (server_io, client_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let socket = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let (reader, mut writer) = split_websocket(socket);
            let mut framed = FramedReader::new(reader, Duration::from_secs(1));
            let body = framed.next_frame().await.unwrap().unwrap();
            writer.write_chunk(encode_frame(&body).unwrap()).await.unwrap();
            writer.close().await;
        });

        let (socket, _) = tokio_tungstenite::client_async("ws://localhost/", client_io)
            .await
            .unwrap();
        let (reader, mut writer) = split_websocket(socket);
        assert_eq!(reader.kind(), TransportKind::WebSocket);

        // Split one frame over two binary messages.
        let frame = encode_frame(b"echo me").unwrap();
        writer.write_chunk(frame[..3].to_vec()).await.unwrap();
        writer.write_chunk(frame[3..].to_vec()).await.unwrap();

        let mut framed = FramedReader::new(reader, Duration::from_secs(1));
        assert_eq!(framed.next_frame().await.unwrap(), Some(b"echo me".to_vec()));
        assert_eq!(framed.next_frame().await.unwrap(), None);

        server.await.unwrap();
    }
}
