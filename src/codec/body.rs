//! Frame bodies.
//!
//! muxrpc tags every body as a buffer, a string or a JSON document. The tag
//! travels in the two low flag bits of the header.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::JsonCodec;
use crate::error::{MuxrpcError, Result};
use crate::protocol::BodyType;

/// A frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Opaque bytes.
    Buffer(Bytes),
    /// UTF-8 text.
    String(String),
    /// Serialized JSON.
    Json(Bytes),
}

impl Body {
    /// Serialize a value as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Json(JsonCodec::encode(value)?.into()))
    }

    /// Text body.
    pub fn text(text: impl Into<String>) -> Self {
        Self::String(text.into())
    }

    /// Binary body.
    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Self::Buffer(bytes.into())
    }

    /// Empty binary body.
    pub fn empty() -> Self {
        Self::Buffer(Bytes::new())
    }

    /// The JSON `true` used to end a stream normally.
    pub(crate) fn end_marker() -> Self {
        Self::Json(Bytes::from_static(b"true"))
    }

    /// Wire type tag.
    pub fn body_type(&self) -> BodyType {
        match self {
            Self::Buffer(_) => BodyType::Buffer,
            Self::String(_) => BodyType::String,
            Self::Json(_) => BodyType::Json,
        }
    }

    /// Raw bytes as they go on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Buffer(b) | Self::Json(b) => b,
            Self::String(s) => s.as_bytes(),
        }
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True for a zero-length body.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text of a string body.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Decode into a typed value.
    ///
    /// JSON bodies are parsed, string bodies decode as a JSON string so a
    /// `String` target works for both. Buffers have no structured form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Json(bytes) => {
                JsonCodec::decode(bytes).map_err(|e| MuxrpcError::Decode(e.to_string()))
            }
            Self::String(s) => serde_json::from_value(serde_json::Value::String(s.clone()))
                .map_err(|e| MuxrpcError::Decode(e.to_string())),
            Self::Buffer(_) => Err(MuxrpcError::Decode(
                "binary body has no structured value".to_string(),
            )),
        }
    }

    /// Decode into a dynamic JSON value. Buffers become an array of bytes.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        match self {
            Self::Buffer(bytes) => Ok(serde_json::Value::from(bytes.to_vec())),
            _ => self.decode(),
        }
    }

    /// Rebuild a body from its wire type and bytes.
    pub(crate) fn from_wire(body_type: BodyType, bytes: Bytes) -> Result<Self> {
        Ok(match body_type {
            BodyType::Buffer => Self::Buffer(bytes),
            BodyType::Json => Self::Json(bytes),
            BodyType::String => Self::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| MuxrpcError::protocol("String body is not valid UTF-8"))?,
            ),
        })
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}
