//! Handles for calls in flight.
//!
//! - [`AsyncResponse`] - future resolving to the single reply
//! - [`Source`] - stream of values from the other side, finished by an end frame
//! - [`Sink`] - values going to the other side, finished with [`Sink::close`]
//! - [`Duplex`] - a sink and a source sharing one request id
//!
//! # Example
//!
//! ```ignore
//! let mut names = session.source("stuff", ())?;
//! while let Some(name) = names.next_as::<String>().await {
//!     println!("{}", name?);
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::codec::Body;
use crate::error::{MuxrpcError, Result};
use crate::handler::CallKind;
use crate::protocol::Frame;
use crate::writer::WriterHandle;

/// Sending half feeding a [`Source`].
pub(crate) type SourceSender = mpsc::UnboundedSender<Result<Body>>;

/// Pending result of an async call.
pub struct AsyncResponse {
    rx: oneshot::Receiver<Result<Body>>,
}

impl AsyncResponse {
    pub(crate) fn new() -> (oneshot::Sender<Result<Body>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the reply and decode it.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T> {
        self.await?.decode()
    }
}

impl Future for AsyncResponse {
    type Output = Result<Body>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(MuxrpcError::ConnectionClosed)))
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResponse").finish_non_exhaustive()
    }
}

/// Finite, forward-only sequence of values.
///
/// Yields each data frame in wire order. An error ends the sequence; after
/// the end nothing more is yielded.
pub struct Source {
    rx: mpsc::UnboundedReceiver<Result<Body>>,
    done: bool,
}

impl Source {
    pub(crate) fn new() -> (SourceSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, done: false })
    }

    /// Next value, or `None` after the end.
    pub async fn next(&mut self) -> Option<Result<Body>> {
        futures::StreamExt::next(self).await
    }

    /// Next value decoded into `T`.
    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        let item = self.next().await?;
        Some(item.and_then(|body| body.decode()))
    }

    /// Drain the rest of the sequence.
    ///
    /// # Errors
    ///
    /// Returns the first error: a remote error ending the stream, a closed
    /// session, or a value that does not decode.
    pub async fn collect_as<T: DeserializeOwned>(mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        while let Some(value) = self.next_as().await {
            values.push(value?);
        }
        Ok(values)
    }

    /// True once the end has been observed.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Stream for Source {
    type Item = Result<Body>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("done", &self.done).finish()
    }
}

/// Caller side of a sink (or the sending half of a duplex).
pub struct Sink {
    request_id: i32,
    writer: WriterHandle,
    ack: Option<oneshot::Receiver<Result<()>>>,
    closed: bool,
}

impl Sink {
    pub(crate) fn new(
        request_id: i32,
        writer: WriterHandle,
        ack: Option<oneshot::Receiver<Result<()>>>,
    ) -> Self {
        Self {
            request_id,
            writer,
            ack,
            closed: false,
        }
    }

    /// Request id of the call.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Send a JSON value.
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.send_body(Body::json(value)?).await
    }

    /// Send a body as is.
    ///
    /// # Errors
    ///
    /// Returns a usage error after [`close`](Self::close).
    pub async fn send_body(&mut self, body: Body) -> Result<()> {
        if self.closed {
            return Err(MuxrpcError::Usage(format!(
                "sink {} is already closed",
                self.request_id
            )));
        }
        let frame = Frame::new(self.request_id, body).with_stream(true);
        self.writer.send_frame(&frame).await
    }

    /// Send the end of the stream. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Frame::new(self.request_id, Body::end_marker())
            .with_stream(true)
            .with_end(true);
        self.writer.send_frame(&frame).await
    }

    /// End the stream with an error.
    pub async fn abort(&mut self, message: &str) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let body = crate::error::RemoteError::new(message).to_body();
        let frame = Frame::new(self.request_id, body)
            .with_stream(true)
            .with_end(true);
        self.writer.send_frame(&frame).await
    }

    /// Close, then wait for the callee to end or fail the call.
    ///
    /// For the sending half of a duplex there is nothing to wait for; read
    /// the source half instead.
    pub async fn finish(mut self) -> Result<()> {
        self.close().await?;
        match self.ack.take() {
            Some(ack) => ack.await.unwrap_or(Err(MuxrpcError::ConnectionClosed)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("request_id", &self.request_id)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Both directions of a duplex call.
#[derive(Debug)]
pub struct Duplex {
    /// Values going to the callee.
    pub sink: Sink,
    /// Values coming back.
    pub source: Source,
}

impl Duplex {
    /// Split into the two halves.
    pub fn split(self) -> (Sink, Source) {
        (self.sink, self.source)
    }
}

/// Handle returned by [`Session::call`](crate::Session::call).
#[derive(Debug)]
pub enum Call {
    /// Single reply.
    Async(AsyncResponse),
    /// Stream of replies.
    Source(Source),
    /// Stream towards the callee.
    Sink(Sink),
    /// Streams both ways.
    Duplex(Duplex),
}

impl Call {
    /// Kind of the call.
    pub fn kind(&self) -> CallKind {
        match self {
            Self::Async(_) => CallKind::Async,
            Self::Source(_) => CallKind::Source,
            Self::Sink(_) => CallKind::Sink,
            Self::Duplex(_) => CallKind::Duplex,
        }
    }
}
