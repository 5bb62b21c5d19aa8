//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 9 bytes
//! - `WaitingForBody`: Header parsed, need N more body bytes
//!
//! Once the goodbye header arrives the buffer stops producing frames and
//! discards anything after it.
//!
//! # Example
//!
//! ```
//! use muxrpc::codec::Body;
//! use muxrpc::protocol::{Frame, FrameBuffer};
//!
//! let bytes = Frame::new(1, Body::text("hello")).encode();
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in arbitrary chunks from the transport
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{MuxrpcError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 9 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
    /// Goodbye received, no more frames.
    Closed,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push. An empty vector means more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an invalid header or body. The buffer
    /// is unusable afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        if matches!(self.state, State::Closed) {
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::Closed => return Ok(None),

                State::WaitingForHeader => {
                    let Some(header) = Header::decode(&self.buffer) else {
                        return Ok(None);
                    };
                    header.validate(self.max_body_size)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.is_goodbye() {
                        tracing::debug!(
                            discarded = self.buffer.len(),
                            "goodbye received"
                        );
                        self.buffer.clear();
                        self.state = State::Closed;
                        return Ok(None);
                    }

                    self.state = State::WaitingForBody { header };
                }

                State::WaitingForBody { header } => {
                    let header = *header;
                    let len = header.body_length as usize;
                    if self.buffer.len() < len {
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(len).freeze();
                    self.state = State::WaitingForHeader;
                    return Frame::from_parts(header, body).map(Some);
                }
            }
        }
    }

    /// Signal end of input.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a frame was cut off mid-way.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            State::Closed => Ok(()),
            State::WaitingForHeader if self.buffer.is_empty() => Ok(()),
            _ => Err(MuxrpcError::protocol(format!(
                "Connection ended inside a frame ({} bytes buffered)",
                self.buffered_len()
            ))),
        }
    }

    /// True once the goodbye packet has been seen.
    pub fn saw_goodbye(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Number of bytes held, including a parsed header awaiting its body.
    pub fn buffered_len(&self) -> usize {
        match self.state {
            State::WaitingForBody { .. } => HEADER_SIZE + self.buffer.len(),
            _ => self.buffer.len(),
        }
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffered_len() == 0
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
            State::Closed => "Closed",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
