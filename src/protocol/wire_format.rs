//! Wire format encoding and decoding.
//!
//! Implements the 9-byte muxrpc packet header:
//! ```text
//! ┌────────┬────────────┬────────────┐
//! │ Flags  │ Body len   │ Request id │
//! │ 1 byte │ uint32 BE  │ int32 BE   │
//! └────────┴────────────┴────────────┘
//! ```
//!
//! A header of nine zero bytes is the goodbye packet that ends a stream.

use crate::error::{MuxrpcError, Result};

/// Header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Default maximum body size (64 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// The goodbye packet: an all-zero header with no body.
pub const GOODBYE: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Flag constants for the protocol.
pub mod flags {
    /// Body type bits (see [`super::BodyType`]).
    pub const TYPE_MASK: u8 = 0b0000_0011;
    /// Body type: UTF-8 string.
    pub const TYPE_STRING: u8 = 0b0000_0001;
    /// Body type: JSON.
    pub const TYPE_JSON: u8 = 0b0000_0010;
    /// End of stream, or error for a single response.
    pub const END_ERR: u8 = 0b0000_0100;
    /// Part of a stream.
    pub const STREAM: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Encoding of a frame body, stored in the two low flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// Opaque bytes.
    Buffer,
    /// UTF-8 text.
    String,
    /// JSON document.
    Json,
}

impl BodyType {
    /// Extract the body type from a flags byte. `None` for the unused value 3.
    pub fn from_flags(f: u8) -> Option<Self> {
        match f & flags::TYPE_MASK {
            0 => Some(Self::Buffer),
            flags::TYPE_STRING => Some(Self::String),
            flags::TYPE_JSON => Some(Self::Json),
            _ => None,
        }
    }

    /// The flag bits for this body type.
    pub fn flag(self) -> u8 {
        match self {
            Self::Buffer => 0,
            Self::String => flags::TYPE_STRING,
            Self::Json => flags::TYPE_JSON,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Body length in bytes.
    pub body_length: u32,
    /// Request id. Positive for calls, negative for responses.
    pub request_id: i32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, body_length: u32, request_id: i32) -> Self {
        Self {
            flags,
            body_length,
            request_id,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use muxrpc::protocol::{flags, Header};
    ///
    /// let header = Header::new(flags::TYPE_JSON, 100, -42);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 9);
    /// assert_eq!(bytes[0], flags::TYPE_JSON);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.body_length.to_be_bytes());
        buf[5..9].copy_from_slice(&self.request_id.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[0],
            body_length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            request_id: i32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Reserved flag bits are 0
    /// - Body type is one of buffer/string/json
    /// - Body length doesn't exceed max
    /// - Request id 0 only appears in the goodbye packet
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.is_goodbye() {
            return Ok(());
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(MuxrpcError::protocol(format!(
                "Reserved flag bits must be 0 (flags {:#04x})",
                self.flags
            )));
        }

        if BodyType::from_flags(self.flags).is_none() {
            return Err(MuxrpcError::protocol("Unknown body type 3"));
        }

        if self.body_length > max_body_size {
            return Err(MuxrpcError::protocol(format!(
                "Body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }

        if self.request_id == 0 {
            return Err(MuxrpcError::protocol("Request id 0 is reserved"));
        }

        Ok(())
    }

    /// True for the all-zero goodbye header.
    #[inline]
    pub fn is_goodbye(&self) -> bool {
        self.flags == 0 && self.body_length == 0 && self.request_id == 0
    }

    /// Check if this is part of a stream.
    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM)
    }

    /// Check if the end/error flag is set.
    #[inline]
    pub fn is_end(&self) -> bool {
        flags::has_flag(self.flags, flags::END_ERR)
    }

    /// Body type, if valid.
    #[inline]
    pub fn body_type(&self) -> Option<BodyType> {
        BodyType::from_flags(self.flags)
    }
}
