//! Frame routing and inbound call dispatch.
//!
//! Routing runs with the frame buffer lock held and never awaits: replies
//! produced here are handed to spawned tasks so a full writer queue cannot
//! stall the read side.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;

use super::table::{InboundCall, PendingCall, Reply};
use super::Session;
use crate::call::Source;
use crate::codec::CallRequest;
use crate::error::{MuxrpcError, RemoteError, Result};
use crate::handler::{CallKind, RequestContext};
use crate::observer::CallOutcome;
use crate::protocol::Frame;

impl Session {
    /// Route one decoded frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for frames that break the call state
    /// machine. The caller tears the session down.
    pub(super) fn route(&self, frame: Frame) -> Result<()> {
        if frame.is_response() {
            return self.route_response(frame);
        }

        let request_id = frame.request_id;
        let mut table = self.inner.table.lock();

        if let Some(call) = table.inbound.get_mut(&request_id) {
            if !frame.stream {
                return Err(MuxrpcError::protocol(format!(
                    "Duplicate request id {request_id}"
                )));
            }
            if frame.end {
                // The caller ended its half. Dropping the sender ends the input.
                if let Some(input) = call.input.take() {
                    if let Some(error) = RemoteError::from_end_body(&frame.body) {
                        let _ = input.send(Err(MuxrpcError::Remote(error)));
                    }
                }
                return Ok(());
            }
            if !call.kind.caller_streams() {
                return Err(MuxrpcError::protocol(format!(
                    "Stream data for {} call {request_id}",
                    call.kind
                )));
            }
            match &call.input {
                Some(input) => {
                    let _ = input.send(Ok(frame.body));
                }
                None => tracing::debug!(request_id, "data after end of input, ignored"),
            }
            return Ok(());
        }

        if table.seen_inbound(request_id) {
            if frame.stream {
                tracing::debug!(request_id, "stream frame for finished call, ignored");
                return Ok(());
            }
            return Err(MuxrpcError::protocol(format!(
                "Duplicate request id {request_id}"
            )));
        }

        drop(table);
        self.dispatch(frame)
    }

    /// Deliver a reply to one of our calls.
    fn route_response(&self, frame: Frame) -> Result<()> {
        let request_id = frame.correlation_id() as i32;
        let mut table = self.inner.table.lock();

        let Some(pending) = table.outbound.get(&request_id) else {
            return Err(MuxrpcError::protocol(format!(
                "Response for unknown request {request_id}"
            )));
        };
        let kind = pending.reply.kind();

        let finishes = match kind {
            CallKind::Async if frame.stream => {
                return Err(MuxrpcError::protocol(format!(
                    "Stream frame for async call {request_id}"
                )));
            }
            CallKind::Async => true,
            CallKind::Sink if !frame.end => {
                return Err(MuxrpcError::protocol(format!(
                    "Data frame for sink call {request_id}"
                )));
            }
            CallKind::Sink => true,
            CallKind::Source | CallKind::Duplex if !frame.stream && !frame.end => {
                return Err(MuxrpcError::protocol(format!(
                    "Single reply to {kind} call {request_id}"
                )));
            }
            CallKind::Source | CallKind::Duplex => frame.end,
        };

        if !finishes {
            if let Reply::Source(tx) | Reply::Duplex(tx) = &pending.reply {
                let _ = tx.send(Ok(frame.body));
            }
            return Ok(());
        }

        let Some(PendingCall {
            method,
            started,
            reply,
        }) = table.outbound.remove(&request_id)
        else {
            return Ok(());
        };
        drop(table);

        let error = match (kind, frame.end) {
            (CallKind::Async, false) => None,
            // An end on an async call, or a single end on a stream call,
            // is always an error.
            (CallKind::Async, true) => Some(RemoteError::from_body(&frame.body)),
            _ if !frame.stream => Some(RemoteError::from_body(&frame.body)),
            _ => RemoteError::from_end_body(&frame.body),
        };

        let outcome = match &error {
            Some(e) => CallOutcome::Failed(e.to_string()),
            None => CallOutcome::Completed,
        };
        self.inner
            .observer
            .call_completed(request_id, &method, &outcome, started.elapsed());

        match reply {
            Reply::Async(tx) => {
                let result = match error {
                    Some(e) => Err(MuxrpcError::Remote(e)),
                    None => Ok(frame.body),
                };
                let _ = tx.send(result);
            }
            Reply::Source(tx) | Reply::Duplex(tx) => {
                if let Some(e) = error {
                    let _ = tx.send(Err(MuxrpcError::Remote(e)));
                }
            }
            Reply::Sink(tx) => {
                let _ = tx.send(error.map_or(Ok(()), |e| Err(MuxrpcError::Remote(e))));
            }
        }
        Ok(())
    }

    /// Start serving a new inbound call.
    fn dispatch(&self, frame: Frame) -> Result<()> {
        let request_id = frame.request_id;
        let request = CallRequest::from_body(&frame.body)?;
        let kind = request.kind()?;
        if frame.stream != kind.is_stream() {
            return Err(MuxrpcError::protocol(format!(
                "Stream flag does not match {kind} call {request_id}"
            )));
        }
        let method = request.method();

        self.inner.observer.inbound_call(request_id, &method, kind);

        let handler = match self.inner.registry.lookup(&method) {
            Some((declared, Some(handler))) if declared == kind => handler,
            Some((declared, Some(_))) => {
                self.reject(
                    request_id,
                    kind,
                    format!("{method} is a {declared} method, not {kind}"),
                );
                return Ok(());
            }
            _ => {
                self.reject(request_id, kind, format!("No such method: {method}"));
                return Ok(());
            }
        };

        let Ok(permit) = self.inner.handler_slots.clone().try_acquire_owned() else {
            tracing::warn!(
                request_id,
                method = %method,
                "handler capacity reached, rejecting call"
            );
            self.reject(request_id, kind, "Too many concurrent calls".to_string());
            return Ok(());
        };

        let (input_tx, input) = if kind.caller_streams() {
            let (tx, source) = Source::new();
            (Some(tx), Some(source))
        } else {
            (None, None)
        };
        self.inner.table.lock().open_inbound(
            request_id,
            InboundCall {
                kind,
                input: input_tx,
            },
        );

        let ctx = RequestContext::with_writer(
            request_id,
            &method,
            kind,
            self.inner.writer.clone(),
            input,
        );
        let args = request.args;
        let session = self.clone();

        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;

            let result = AssertUnwindSafe(handler.call(args, ctx.clone()))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) if ctx.is_finished() => {}
                Ok(Ok(())) => {
                    // Returned without answering: end the call normally.
                    let sent = if kind.is_stream() {
                        ctx.end().await
                    } else {
                        ctx.respond(&Value::Null).await
                    };
                    if let Err(e) = sent {
                        tracing::debug!(request_id, error = %e, "could not finish call");
                    }
                }
                Ok(Err(e)) if ctx.is_finished() => {
                    tracing::warn!(
                        request_id,
                        method = ctx.method(),
                        error = %e,
                        "handler failed after finishing the call"
                    );
                }
                Ok(Err(e)) => {
                    tracing::debug!(request_id, method = ctx.method(), error = %e, "handler error");
                    if let Err(send) = ctx.error(e.message()).await {
                        tracing::debug!(request_id, error = %send, "could not send error reply");
                    }
                }
                Err(_) => {
                    tracing::error!(request_id, method = ctx.method(), "handler panicked");
                    if !ctx.is_finished() {
                        let _ = ctx.error("handler panicked").await;
                    }
                }
            }

            session.inner.table.lock().inbound.remove(&request_id);
        });

        Ok(())
    }

    /// Answer a call we will not serve with an error frame.
    fn reject(&self, request_id: i32, kind: CallKind, message: String) {
        tracing::debug!(request_id, %message, "rejecting inbound call");
        self.inner.table.lock().note_inbound(request_id);

        let frame = Frame::new(-request_id, RemoteError::new(message).to_body())
            .with_stream(kind.is_stream())
            .with_end(true);
        let writer = self.inner.writer.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.send_frame(&frame).await {
                tracing::debug!(request_id, error = %e, "could not send error reply");
            }
        });
    }
}
