//! Session observer hooks.
//!
//! A [`SessionObserver`] sees call lifecycle events without touching the
//! wire. Every hook has a no-op default. [`TracingObserver`], the default,
//! forwards events to `tracing`.

use std::fmt;
use std::time::Duration;

use crate::error::MuxrpcError;
use crate::handler::CallKind;

/// How an outbound call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Reply received or stream ended normally.
    Completed,
    /// The remote side answered with an error.
    Failed(String),
    /// The session closed first.
    Cancelled,
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Local,
    /// The peer sent goodbye.
    Goodbye,
    /// The read side ended.
    EndOfStream,
    /// The peer broke the protocol.
    ProtocolError(String),
    /// Reading or writing failed.
    TransportError(String),
}

impl CloseReason {
    /// True for closes that were not caused by an error.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Local | Self::Goodbye | Self::EndOfStream)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Goodbye => f.write_str("peer said goodbye"),
            Self::EndOfStream => f.write_str("end of stream"),
            Self::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Self::TransportError(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// Hooks for session events.
pub trait SessionObserver: Send + Sync + 'static {
    /// An outbound call was sent.
    fn call_started(&self, _request_id: i32, _method: &str, _kind: CallKind) {}

    /// An outbound call finished.
    fn call_completed(
        &self,
        _request_id: i32,
        _method: &str,
        _outcome: &CallOutcome,
        _elapsed: Duration,
    ) {
    }

    /// The peer called one of our methods.
    fn inbound_call(&self, _request_id: i32, _method: &str, _kind: CallKind) {}

    /// The peer violated the protocol. The session closes next.
    fn protocol_error(&self, _error: &MuxrpcError) {}

    /// The session closed.
    fn session_closed(&self, _reason: &CloseReason) {}
}

/// Observer that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn call_started(&self, request_id: i32, method: &str, kind: CallKind) {
        tracing::debug!(request_id, method, %kind, "call started");
    }

    fn call_completed(
        &self,
        request_id: i32,
        method: &str,
        outcome: &CallOutcome,
        elapsed: Duration,
    ) {
        match outcome {
            CallOutcome::Failed(error) => {
                tracing::debug!(request_id, method, ?elapsed, %error, "call failed")
            }
            _ => tracing::debug!(request_id, method, ?elapsed, ?outcome, "call finished"),
        }
    }

    fn inbound_call(&self, request_id: i32, method: &str, kind: CallKind) {
        tracing::debug!(request_id, method, %kind, "inbound call");
    }

    fn protocol_error(&self, error: &MuxrpcError) {
        tracing::error!(%error, "protocol violation");
    }

    fn session_closed(&self, reason: &CloseReason) {
        if reason.is_clean() {
            tracing::debug!(%reason, "session closed");
        } else {
            tracing::warn!(%reason, "session closed");
        }
    }
}
