//! Error types for muxrpc sessions.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Body;
use crate::handler::CallKind;

/// Main error type for all muxrpc operations.
#[derive(Debug, Error)]
pub enum MuxrpcError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (malformed frame, unknown request id, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The method is not declared in the registry.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The method is declared with a different call kind.
    #[error("Method {method} is declared as {declared}, not {requested}")]
    KindMismatch {
        /// Method name.
        method: String,
        /// Kind in the registry.
        declared: CallKind,
        /// Kind the caller asked for.
        requested: CallKind,
    },

    /// Method name is empty or has empty segments.
    #[error("Invalid method name: {0:?}")]
    InvalidMethodName(String),

    /// Method registered twice.
    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    /// API misuse, e.g. responding twice to the same request.
    #[error("Usage error: {0}")]
    Usage(String),

    /// The remote side answered with an error.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// A body could not be decoded into the requested type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Session closed (locally, by goodbye, or after a fatal error).
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Coarse classification of a [`MuxrpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport failure, fatal to the session.
    Transport,
    /// Protocol violation, fatal to the session.
    Protocol,
    /// Failure local to a single call.
    Application,
    /// Rejected before anything was sent.
    Usage,
}

impl MuxrpcError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::ConnectionClosed => ErrorClass::Transport,
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::Remote(_) | Self::Decode(_) => ErrorClass::Application,
            Self::Json(_)
            | Self::MethodNotFound(_)
            | Self::KindMismatch { .. }
            | Self::InvalidMethodName(_)
            | Self::DuplicateMethod(_)
            | Self::Usage(_) => ErrorClass::Usage,
        }
    }

    /// True if this error ends the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Protocol)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Result type alias using MuxrpcError.
pub type Result<T> = std::result::Result<T, MuxrpcError>;

fn default_error_name() -> String {
    "Error".to_string()
}

/// Error object carried in an end-flagged frame.
///
/// Serialized as `{"name": "Error", "message": "..."}`. Peers that send a
/// bare string body are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error name, `"Error"` unless the peer says otherwise.
    #[serde(default = "default_error_name")]
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Optional stack trace from the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Create an error object with the default name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: default_error_name(),
            message: message.into(),
            stack: None,
        }
    }

    /// Interpret any error body.
    pub fn from_body(body: &Body) -> Self {
        match body {
            Body::Json(bytes) => match serde_json::from_slice::<serde_json::Value>(bytes) {
                Ok(serde_json::Value::String(message)) => Self::new(message),
                Ok(value @ serde_json::Value::Object(_)) => serde_json::from_value(value.clone())
                    .unwrap_or_else(|_| Self::new(value.to_string())),
                Ok(other) => Self::new(other.to_string()),
                Err(_) => Self::new(String::from_utf8_lossy(bytes)),
            },
            Body::String(message) => Self::new(message.clone()),
            Body::Buffer(bytes) => Self::new(String::from_utf8_lossy(bytes)),
        }
    }

    /// Interpret the body of an end frame: `None` for a normal end
    /// (`true`, `null` or empty), `Some` for an error.
    pub fn from_end_body(body: &Body) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        if let Body::Json(bytes) = body {
            if let Ok(serde_json::Value::Bool(true) | serde_json::Value::Null) =
                serde_json::from_slice::<serde_json::Value>(bytes)
            {
                return None;
            }
        }
        Some(Self::from_body(body))
    }

    /// Encode as a JSON body.
    pub fn to_body(&self) -> Body {
        // A struct of three strings always serializes.
        Body::Json(serde_json::to_vec(self).unwrap_or_default().into())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Error returned by method handlers.
///
/// Converts from any `std::error::Error`, so `?` works inside handlers.
/// The message is sent back to the caller as an error frame.
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerError").field(&self.message).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(MuxrpcError::ConnectionClosed.class(), ErrorClass::Transport);
        assert_eq!(
            MuxrpcError::Protocol("x".into()).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            MuxrpcError::Remote(RemoteError::new("boom")).class(),
            ErrorClass::Application
        );
        assert_eq!(
            MuxrpcError::MethodNotFound("missing".into()).class(),
            ErrorClass::Usage
        );
        assert!(MuxrpcError::Protocol("x".into()).is_fatal());
        assert!(!MuxrpcError::MethodNotFound("x".into()).is_fatal());
    }

    #[test]
    fn test_remote_error_from_json_object() {
        let body = Body::Json(
            br#"{"name":"TypeError","message":"bad","stack":"at x"}"#
                .to_vec()
                .into(),
        );
        let err = RemoteError::from_body(&body);
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "bad");
        assert_eq!(err.stack.as_deref(), Some("at x"));
    }

    #[test]
    fn test_remote_error_from_string_body() {
        let err = RemoteError::from_body(&Body::String("No such method available".into()));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "No such method available");
    }

    #[test]
    fn test_end_body_true_is_not_an_error() {
        assert!(RemoteError::from_end_body(&Body::Json(b"true".to_vec().into())).is_none());
        assert!(RemoteError::from_end_body(&Body::Json(b"null".to_vec().into())).is_none());
        assert!(RemoteError::from_end_body(&Body::empty()).is_none());
        assert!(RemoteError::from_end_body(&Body::String("nope".into())).is_some());
    }

    #[test]
    fn test_remote_error_body_roundtrip() {
        let err = RemoteError::new("it broke");
        let back = RemoteError::from_body(&err.to_body());
        assert_eq!(back, err);
        assert_eq!(back.to_string(), "Error: it broke");
    }

    #[test]
    fn test_handler_error_from_std_error() {
        fn parse(s: &str) -> std::result::Result<i32, HandlerError> {
            Ok(s.parse::<i32>()?)
        }
        let err = parse("nope").unwrap_err();
        assert!(err.message().contains("invalid digit"));
    }
}
