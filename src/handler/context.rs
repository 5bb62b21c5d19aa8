//! Request context for handlers.
//!
//! Provides methods for answering an inbound call:
//! - `respond` - send the single reply of an async call
//! - `chunk` - send one value of a source or duplex stream
//! - `end` - end the stream normally
//! - `error` - fail the call
//! - `take_input` - the caller's stream for sink and duplex calls
//!
//! Replies carry the negated request id. Exactly one terminal frame
//! (`respond`, `end` or `error`) is sent per call.
//!
//! # Example
//!
//! ```ignore
//! async fn count(n: u32, ctx: RequestContext) -> HandlerResult {
//!     for i in 0..n {
//!         ctx.chunk(&i).await?;
//!     }
//!     ctx.end().await?;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::CallKind;
use crate::call::Source;
use crate::codec::Body;
use crate::error::{MuxrpcError, RemoteError, Result};
use crate::protocol::Frame;
use crate::writer::WriterHandle;

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone` and can be moved into spawned tasks. All
/// clones share the same finished flag.
#[derive(Clone)]
pub struct RequestContext {
    request_id: i32,
    method: Arc<str>,
    kind: CallKind,
    writer: Option<WriterHandle>,
    finished: Arc<AtomicBool>,
    input: Arc<Mutex<Option<Source>>>,
}

impl RequestContext {
    /// Create a context that discards everything it sends (for testing).
    pub fn new(request_id: i32, method: &str, kind: CallKind) -> Self {
        Self {
            request_id,
            method: Arc::from(method),
            kind,
            writer: None,
            finished: Arc::new(AtomicBool::new(false)),
            input: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a context that replies through the session writer.
    pub(crate) fn with_writer(
        request_id: i32,
        method: &str,
        kind: CallKind,
        writer: WriterHandle,
        input: Option<Source>,
    ) -> Self {
        Self {
            writer: Some(writer),
            input: Arc::new(Mutex::new(input)),
            ..Self::new(request_id, method, kind)
        }
    }

    /// Request id chosen by the caller.
    #[inline]
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Dotted method name.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Kind of the call.
    #[inline]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// True once a terminal frame has been sent.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Take the caller's stream. `Some` once, for sink and duplex calls.
    pub fn take_input(&self) -> Option<Source> {
        self.input.lock().take()
    }

    /// Reply to an async call with a JSON value.
    pub async fn respond<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.respond_body(Body::json(value)?).await
    }

    /// Reply to an async call with a body as is.
    ///
    /// # Errors
    ///
    /// Returns a usage error for streaming calls or when the call is
    /// already finished.
    pub async fn respond_body(&self, body: Body) -> Result<()> {
        if self.kind.is_stream() {
            return Err(MuxrpcError::Usage(format!(
                "{} is a {} call, use chunk() and end()",
                self.method, self.kind
            )));
        }
        self.finish()?;
        self.send(Frame::new(-self.request_id, body)).await
    }

    /// Send one value of a source or duplex stream.
    pub async fn chunk<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.chunk_body(Body::json(value)?).await
    }

    /// Send one stream value as is.
    ///
    /// # Errors
    ///
    /// Returns a usage error unless this is a source or duplex call that
    /// has not finished.
    pub async fn chunk_body(&self, body: Body) -> Result<()> {
        if !self.kind.callee_streams() {
            return Err(MuxrpcError::Usage(format!(
                "{} is a {} call and cannot stream values back",
                self.method, self.kind
            )));
        }
        if self.is_finished() {
            return Err(MuxrpcError::Usage(format!(
                "request {} already finished",
                self.request_id
            )));
        }
        self.send(Frame::new(-self.request_id, body).with_stream(true))
            .await
    }

    /// End a source, sink or duplex call normally.
    pub async fn end(&self) -> Result<()> {
        if !self.kind.is_stream() {
            return Err(MuxrpcError::Usage(format!(
                "{} is an async call, use respond()",
                self.method
            )));
        }
        self.finish()?;
        let frame = Frame::new(-self.request_id, Body::end_marker())
            .with_stream(true)
            .with_end(true);
        self.send(frame).await
    }

    /// Fail the call with a message.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.error_with(RemoteError::new(message)).await
    }

    /// Fail the call with an error object.
    pub async fn error_with(&self, error: RemoteError) -> Result<()> {
        self.finish()?;
        let frame = Frame::new(-self.request_id, error.to_body())
            .with_stream(self.kind.is_stream())
            .with_end(true);
        self.send(frame).await
    }

    fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(MuxrpcError::Usage(format!(
                "request {} already finished",
                self.request_id
            )));
        }
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.send_frame(&frame).await,
            // No writer configured (testing mode)
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("finished", &self.is_finished())
            .finish()
    }
}
