//! Dedicated writer task for frame sending.
//!
//! The session never touches the write half directly. Callers, handlers and
//! the routing loop all push encoded frames into a bounded mpsc channel and
//! one task drains it, coalescing whatever is queued into a single write.
//!
//! # Architecture
//!
//! ```text
//! Caller    ─┐
//! Handler 1 ─┼─► mpsc::Sender<WriterCommand> ─► Writer Task ─► write half
//! Handler N ─┘
//! ```
//!
//! The bounded channel is the backpressure: `send` waits while the queue is
//! full. A `Close` command writes the goodbye packet (optionally) after
//! everything queued before it, then shuts the write half down.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::Body;
use crate::error::{MuxrpcError, Result};
use crate::protocol::{Frame, Header, GOODBYE, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to coalesce in a single write.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Body bytes.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create an outbound frame from a header and body.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Encode a frame.
    pub fn from_frame(frame: &Frame) -> Self {
        let payload = match &frame.body {
            Body::Buffer(b) | Body::Json(b) => b.clone(),
            Body::String(s) => Bytes::copy_from_slice(s.as_bytes()),
        };
        Self::new(&frame.header(), payload)
    }

    /// Total size of this frame (header + body).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Message for the writer task.
#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// Write a frame.
    Frame(OutboundFrame),
    /// Stop after everything queued so far.
    Close { goodbye: bool },
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone and shared by every call and handler of a session.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(WriterCommand::Frame(frame))
            .await
            .map_err(|_| MuxrpcError::ConnectionClosed)
    }

    /// Encode and queue a frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(OutboundFrame::from_frame(frame)).await
    }

    /// Ask the writer task to finish.
    ///
    /// Never waits: if the queue is full the request is handed to a
    /// background task so teardown cannot stall on a slow peer.
    pub(crate) fn close(&self, goodbye: bool) {
        let command = WriterCommand::Close { goodbye };
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(command).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// True once the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The `JoinHandle` resolves when the task stops: `Ok` after a close or
/// when every handle is dropped, `Err` on a write failure.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Receive frames and write them out in batches.
async fn writer_loop<W>(mut rx: mpsc::Receiver<WriterCommand>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);

    loop {
        let first = match rx.recv().await {
            Some(command) => command,
            None => {
                // Every handle dropped.
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut close = None;
        match first {
            WriterCommand::Frame(frame) => push_frame(&mut buf, &frame),
            WriterCommand::Close { goodbye } => close = Some(goodbye),
        }

        let mut batched = 1;
        while close.is_none() && batched < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(WriterCommand::Frame(frame)) => push_frame(&mut buf, &frame),
                Ok(WriterCommand::Close { goodbye }) => close = Some(goodbye),
                Err(_) => break,
            }
            batched += 1;
        }

        if let Some(goodbye) = close {
            if goodbye {
                buf.extend_from_slice(&GOODBYE);
            }
            let result = flush_batch(&mut writer, &mut buf).await;
            let _ = writer.shutdown().await;
            tracing::debug!(goodbye, "writer closed");
            return result;
        }

        if let Err(e) = flush_batch(&mut writer, &mut buf).await {
            tracing::error!(error = %e, "write failed");
            return Err(e);
        }
    }
}

#[inline]
fn push_frame(buf: &mut BytesMut, frame: &OutboundFrame) {
    buf.reserve(frame.size());
    buf.extend_from_slice(&frame.header);
    buf.extend_from_slice(&frame.payload);
}

async fn flush_batch<W>(writer: &mut W, buf: &mut BytesMut) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if buf.is_empty() {
        return Ok(());
    }
    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}
