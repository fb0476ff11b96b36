//! Length-delimited framing.
//!
//! A frame is a 4-byte big-endian length followed by that many body bytes.
//! Transports deliver bytes in arbitrary chunk sizes, so decoding is
//! incremental: [`FrameDecoder`] buffers input and yields complete bodies.
//! A partially buffered frame means "need more input", never an error; the
//! caller decides how long to wait for the rest.
//!
//! ```
//! use shared::framing::{encode_frame, FrameDecoder};
//!
//! let frame = encode_frame(b"hello").unwrap();
//! let mut decoder = FrameDecoder::new();
//! decoder.extend(&frame[..3]);
//! assert_eq!(decoder.next_frame().unwrap(), None);
//! decoder.extend(&frame[3..]);
//! assert_eq!(decoder.next_frame().unwrap(), Some(b"hello".to_vec()));
//! ```

use crate::error::FramingError;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted frame body (64 KiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Prefixes `body` with its length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FramingError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(FramingError::Oversized {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Incremental frame reassembly buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }

    pub fn with_limit(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends bytes received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops the next complete frame body, if one is buffered.
    ///
    /// An oversized length prefix is rejected as soon as the header is
    /// visible, before any body bytes are buffered for it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(FramingError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let body = self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buffer.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(body))
    }

    /// True while bytes of an incomplete frame are waiting for more input.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
