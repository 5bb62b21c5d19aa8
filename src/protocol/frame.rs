//! Frame struct with typed accessors.
//!
//! A frame is one self-delimited packet: header flags, request id and body.
//!
//! # Example
//!
//! ```
//! use muxrpc::codec::Body;
//! use muxrpc::protocol::Frame;
//!
//! let frame = Frame::new(-3, Body::text("hello")).with_stream(true);
//!
//! assert!(frame.is_response());
//! assert_eq!(frame.correlation_id(), 3);
//! assert_eq!(frame.body.as_bytes(), b"hello");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{flags, Header, HEADER_SIZE};
use crate::codec::Body;
use crate::error::{MuxrpcError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request id. Positive when sent by the caller, negative when answering.
    pub request_id: i32,
    /// Part of a stream.
    pub stream: bool,
    /// End of stream, or error for a single response.
    pub end: bool,
    /// Decoded body.
    pub body: Body,
}

impl Frame {
    /// Create a single (non-stream, non-end) frame.
    pub fn new(request_id: i32, body: Body) -> Self {
        Self {
            request_id,
            stream: false,
            end: false,
            body,
        }
    }

    /// Set the stream flag.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set the end/error flag.
    pub fn with_end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }

    /// Build a frame from a validated header and its body bytes.
    pub fn from_parts(header: Header, body: Bytes) -> Result<Self> {
        let body_type = header
            .body_type()
            .ok_or_else(|| MuxrpcError::protocol("Unknown body type 3"))?;
        Ok(Self {
            request_id: header.request_id,
            stream: header.is_stream(),
            end: header.is_end(),
            body: Body::from_wire(body_type, body)?,
        })
    }

    /// The wire header for this frame.
    pub fn header(&self) -> Header {
        let mut f = self.body.body_type().flag();
        if self.stream {
            f |= flags::STREAM;
        }
        if self.end {
            f |= flags::END_ERR;
        }
        Header::new(f, self.body.len() as u32, self.request_id)
    }

    /// Encode header and body into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        build_frame(&self.header(), self.body.as_bytes())
    }

    /// True for frames answering one of our calls.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.request_id < 0
    }

    /// The positive id of the call this frame belongs to.
    #[inline]
    pub fn correlation_id(&self) -> u32 {
        self.request_id.unsigned_abs()
    }
}

/// Build a complete frame as a single buffer.
pub fn build_frame(header: &Header, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf.freeze()
}
