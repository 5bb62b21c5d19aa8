//! Outbound and inbound call bookkeeping.
//!
//! Lives behind a `parking_lot::Mutex` in the session. Nothing here awaits,
//! so the lock is never held across a suspension point.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::call::SourceSender;
use crate::codec::Body;
use crate::error::{MuxrpcError, Result};
use crate::handler::CallKind;

/// Where replies for an outbound call go.
pub(crate) enum Reply {
    Async(oneshot::Sender<Result<Body>>),
    Source(SourceSender),
    Sink(oneshot::Sender<Result<()>>),
    Duplex(SourceSender),
}

impl Reply {
    pub(crate) fn kind(&self) -> CallKind {
        match self {
            Self::Async(_) => CallKind::Async,
            Self::Source(_) => CallKind::Source,
            Self::Sink(_) => CallKind::Sink,
            Self::Duplex(_) => CallKind::Duplex,
        }
    }

    /// Complete the call with an error.
    pub(crate) fn fail(self, error: MuxrpcError) {
        match self {
            Self::Async(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Sink(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Source(tx) | Self::Duplex(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// One of our calls awaiting replies.
pub(crate) struct PendingCall {
    pub method: String,
    pub started: Instant,
    pub reply: Reply,
}

/// A call from the peer being served.
pub(crate) struct InboundCall {
    pub kind: CallKind,
    /// Feeds the handler's input for sink and duplex calls. `None` once
    /// the caller ended its stream.
    pub input: Option<SourceSender>,
}

/// Per-session call tables.
pub(crate) struct CallTable {
    next_id: i32,
    pub outbound: HashMap<i32, PendingCall>,
    pub inbound: HashMap<i32, InboundCall>,
    highest_inbound: i32,
    pub closed: bool,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            highest_inbound: 0,
            closed: false,
        }
    }

    /// Next request id, increasing from 1.
    ///
    /// Ids never wrap: the peer treats a reused id as a duplicate call.
    /// Once `i32::MAX` has been handed out every later call fails.
    pub fn allocate_id(&mut self) -> Result<i32> {
        if self.next_id == 0 {
            return Err(MuxrpcError::Usage("request ids exhausted".to_string()));
        }
        let id = self.next_id;
        self.next_id = id.checked_add(1).unwrap_or(0);
        Ok(id)
    }

    /// True if the peer already used this id for a call.
    pub fn seen_inbound(&self, id: i32) -> bool {
        id <= self.highest_inbound
    }

    /// Record an inbound id that gets no table entry (rejected calls).
    pub fn note_inbound(&mut self, id: i32) {
        self.highest_inbound = self.highest_inbound.max(id);
    }

    pub fn open_inbound(&mut self, id: i32, call: InboundCall) {
        self.note_inbound(id);
        self.inbound.insert(id, call);
    }

    #[cfg(test)]
    fn set_next_id(&mut self, id: i32) {
        self.next_id = id;
    }
}
