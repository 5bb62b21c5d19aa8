//! Session builder and runtime.
//!
//! The [`SessionBuilder`] registers local handlers and declares remote
//! methods, then attaches to a byte stream. The [`Session`] it returns:
//! 1. Reads bytes and decodes frames (one reader task)
//! 2. Routes each frame to a pending call, an open stream or a handler
//! 3. Writes frames through the writer task
//! 4. Tears everything down on close, goodbye, EOF or a protocol error
//!
//! # Example
//!
//! ```ignore
//! use muxrpc::{CallKind, HandlerError, Session};
//!
//! #[tokio::main]
//! async fn main() -> muxrpc::Result<()> {
//!     let session = Session::builder()
//!         .handle_async("hello", |(a, b): (String, String)| async move {
//!             Ok::<_, HandlerError>(format!("hello, {a} and {b}!"))
//!         })
//!         .declare("whoami", CallKind::Async)
//!         .spawn(muxrpc::transport::stdio())?;
//!
//!     let me: String = session.request("whoami", &()).await?;
//!     session.closed().await;
//!     Ok(())
//! }
//! ```

mod dispatch;
mod table;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, Semaphore};

use crate::call::{AsyncResponse, Call, Duplex, Sink, Source};
use crate::codec::{CallRequest, JsonCodec};
use crate::error::{HandlerError, MuxrpcError, Result};
use crate::handler::{CallKind, HandlerResult, Manifest, MethodRegistry, RequestContext};
use crate::observer::{CallOutcome, CloseReason, SessionObserver, TracingObserver};
use crate::protocol::{Frame, FrameBuffer, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

use table::{CallTable, PendingCall, Reply};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Name of the method answering with the local manifest.
pub const MANIFEST_METHOD: &str = "manifest";

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest body accepted or sent.
    pub max_body_size: u32,
    /// Writer queue capacity; senders wait when it is full.
    pub channel_capacity: usize,
    /// Inbound calls served at once. Calls above it get an error reply.
    pub max_concurrent_handlers: usize,
    /// Bytes requested per read.
    pub read_buffer_size: usize,
    /// Send the goodbye packet on `close()`.
    pub goodbye_on_close: bool,
    /// Answer the async `manifest` method with the local manifest.
    pub serve_manifest: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            goodbye_on_close: true,
            serve_manifest: false,
        }
    }
}

/// Builder for configuring and creating a [`Session`].
///
/// Registration errors (duplicate or malformed names) are kept and
/// reported when the session is spawned.
pub struct SessionBuilder {
    registry: MethodRegistry,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    error: Option<MuxrpcError>,
}

impl SessionBuilder {
    /// Create a new session builder.
    pub fn new() -> Self {
        Self {
            registry: MethodRegistry::new(),
            config: SessionConfig::default(),
            observer: Arc::new(TracingObserver),
            error: None,
        }
    }

    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register an async method.
    pub fn handle_async<F, T, Fut, R>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let result = self.registry.register_async(method, handler);
        self.record(result)
    }

    /// Register a source method.
    pub fn handle_source<F, T, S, R>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        S: Stream<Item = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let result = self.registry.register_source(method, handler);
        self.record(result)
    }

    /// Register a sink method.
    pub fn handle_sink<F, T, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T, Source) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.registry.register_sink(method, handler);
        self.record(result)
    }

    /// Register a duplex method.
    pub fn handle_duplex<F, T, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.registry.register_duplex(method, handler);
        self.record(result)
    }

    /// Register a handler of any kind that answers through the context.
    pub fn handle<F, T, Fut>(mut self, method: &str, kind: CallKind, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.registry.register_with_context(method, kind, handler);
        self.record(result)
    }

    /// Declare a method served by the peer.
    pub fn declare(mut self, method: &str, kind: CallKind) -> Self {
        let result = self.registry.declare(method, kind);
        self.record(result)
    }

    /// Declare every method of the peer's manifest.
    pub fn manifest(mut self, manifest: &Manifest) -> Self {
        let result = self.registry.declare_manifest(manifest);
        self.record(result)
    }

    /// Replace the method registry.
    pub fn registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Install a session observer.
    pub fn observer(mut self, observer: impl SessionObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum body size.
    ///
    /// Default: 64 MiB
    pub fn max_body_size(mut self, limit: u32) -> Self {
        self.config.max_body_size = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the read buffer size.
    ///
    /// Default: 64 KiB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Send goodbye on `close()`.
    ///
    /// Default: true
    pub fn goodbye_on_close(mut self, enabled: bool) -> Self {
        self.config.goodbye_on_close = enabled;
        self
    }

    /// Serve the local manifest as the async `manifest` method.
    ///
    /// Default: false
    pub fn serve_manifest(mut self, enabled: bool) -> Self {
        self.config.serve_manifest = enabled;
        self
    }

    /// Start a session over a duplex stream.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn<T>(self, io: T) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        self.spawn_split(reader, writer)
    }

    /// Start a session over separate read and write halves.
    pub fn spawn_split<R, W>(self, reader: R, writer: W) -> Result<Session>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = self.attach(writer)?;
        tokio::spawn(read_loop(session.clone(), reader));
        Ok(session)
    }

    /// Start a session that only owns the write half.
    ///
    /// The caller feeds incoming bytes through [`Session::on_bytes`] and
    /// reports the end of input with [`Session::on_eof`].
    pub fn attach<W>(self, writer: W) -> Result<Session>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            mut registry,
            config,
            observer,
            error,
        } = self;
        if let Some(e) = error {
            return Err(e);
        }
        if config.serve_manifest && registry.kind_of(MANIFEST_METHOD).is_none() {
            let mut manifest = registry.manifest();
            manifest.insert(MANIFEST_METHOD, CallKind::Async);
            let manifest = manifest.to_json();
            registry.register_async(MANIFEST_METHOD, move |_: Value| {
                let manifest = manifest.clone();
                async move { Ok::<_, HandlerError>(manifest) }
            })?;
        }

        let (writer, writer_task) = spawn_writer_task(writer, config.channel_capacity);
        let (closed, _) = watch::channel(false);
        let (writer_done, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            registry: Arc::new(registry),
            frames: AsyncMutex::new(FrameBuffer::with_max_body(config.max_body_size)),
            handler_slots: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            config,
            writer,
            table: Mutex::new(CallTable::new()),
            observer,
            closed,
            writer_done,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(CloseReason::TransportError(e.to_string())),
                Err(e) => Some(CloseReason::TransportError(e.to_string())),
            };
            if let Some(inner) = weak.upgrade() {
                let session = Session { inner };
                if let Some(reason) = reason {
                    session.teardown(reason);
                }
                session.inner.writer_done.send_replace(true);
            }
        });

        Ok(Session { inner })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    registry: Arc<MethodRegistry>,
    config: SessionConfig,
    writer: WriterHandle,
    table: Mutex<CallTable>,
    frames: AsyncMutex<FrameBuffer>,
    observer: Arc<dyn SessionObserver>,
    handler_slots: Arc<Semaphore>,
    closed: watch::Sender<bool>,
    writer_done: watch::Sender<bool>,
}

/// A running muxrpc session.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// The method registry.
    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    /// The session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Manifest of the locally served methods.
    pub fn manifest(&self) -> Manifest {
        self.inner.registry.manifest()
    }

    /// Start a call of any kind.
    ///
    /// The method must be declared with exactly this kind. Arguments
    /// serialize to the positional argument array: tuples and sequences
    /// as they are, `()` as no arguments, anything else as one argument.
    ///
    /// # Errors
    ///
    /// Usage errors (`MethodNotFound`, `KindMismatch`, unserializable or
    /// oversized arguments) are returned before anything is written.
    /// `ConnectionClosed` once the session is closed.
    pub async fn call<A>(&self, method: &str, args: &A, kind: CallKind) -> Result<Call>
    where
        A: Serialize + ?Sized,
    {
        self.inner.registry.resolve(method, kind)?;
        let args = JsonCodec::args(args)?;
        let body = CallRequest::new(method, args, kind).to_body()?;
        if body.len() > self.inner.config.max_body_size as usize {
            return Err(MuxrpcError::Usage(format!(
                "request body of {} bytes exceeds maximum {}",
                body.len(),
                self.inner.config.max_body_size
            )));
        }

        let (request_id, call) = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(MuxrpcError::ConnectionClosed);
            }
            let request_id = table.allocate_id()?;
            let (reply, call) = self.open_call(request_id, kind);
            table.outbound.insert(
                request_id,
                PendingCall {
                    method: method.to_string(),
                    started: Instant::now(),
                    reply,
                },
            );
            (request_id, call)
        };

        self.inner.observer.call_started(request_id, method, kind);

        let frame = Frame::new(request_id, body).with_stream(kind.is_stream());
        if let Err(e) = self.inner.writer.send_frame(&frame).await {
            self.inner.table.lock().outbound.remove(&request_id);
            return Err(e);
        }
        Ok(call)
    }

    fn open_call(&self, request_id: i32, kind: CallKind) -> (Reply, Call) {
        let writer = self.inner.writer.clone();
        match kind {
            CallKind::Async => {
                let (tx, response) = AsyncResponse::new();
                (Reply::Async(tx), Call::Async(response))
            }
            CallKind::Source => {
                let (tx, source) = Source::new();
                (Reply::Source(tx), Call::Source(source))
            }
            CallKind::Sink => {
                let (tx, ack) = oneshot::channel();
                let sink = Sink::new(request_id, writer, Some(ack));
                (Reply::Sink(tx), Call::Sink(sink))
            }
            CallKind::Duplex => {
                let (tx, source) = Source::new();
                let sink = Sink::new(request_id, writer, None);
                (Reply::Duplex(tx), Call::Duplex(Duplex { sink, source }))
            }
        }
    }

    /// Start an async call.
    pub async fn async_call<A>(&self, method: &str, args: &A) -> Result<AsyncResponse>
    where
        A: Serialize + ?Sized,
    {
        match self.call(method, args, CallKind::Async).await? {
            Call::Async(response) => Ok(response),
            other => Err(unexpected_call(&other, CallKind::Async)),
        }
    }

    /// Make an async call and decode the reply.
    pub async fn request<T, A>(&self, method: &str, args: &A) -> Result<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.async_call(method, args).await?.decode().await
    }

    /// Start a source call.
    pub async fn source<A>(&self, method: &str, args: &A) -> Result<Source>
    where
        A: Serialize + ?Sized,
    {
        match self.call(method, args, CallKind::Source).await? {
            Call::Source(source) => Ok(source),
            other => Err(unexpected_call(&other, CallKind::Source)),
        }
    }

    /// Start a sink call.
    pub async fn sink<A>(&self, method: &str, args: &A) -> Result<Sink>
    where
        A: Serialize + ?Sized,
    {
        match self.call(method, args, CallKind::Sink).await? {
            Call::Sink(sink) => Ok(sink),
            other => Err(unexpected_call(&other, CallKind::Sink)),
        }
    }

    /// Start a duplex call.
    pub async fn duplex<A>(&self, method: &str, args: &A) -> Result<Duplex>
    where
        A: Serialize + ?Sized,
    {
        match self.call(method, args, CallKind::Duplex).await? {
            Call::Duplex(duplex) => Ok(duplex),
            other => Err(unexpected_call(&other, CallKind::Duplex)),
        }
    }

    /// Feed bytes read from the peer.
    ///
    /// Frames are decoded and routed strictly in order. Concurrent callers
    /// are serialized.
    ///
    /// # Errors
    ///
    /// A protocol violation closes the session and is returned.
    /// `ConnectionClosed` if the session is already closed.
    pub async fn on_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut frames = self.inner.frames.lock().await;
        if self.is_closed() {
            return Err(MuxrpcError::ConnectionClosed);
        }

        let decoded = match frames.push(bytes) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.fail_protocol(e)),
        };
        for frame in decoded {
            if let Err(e) = self.route(frame) {
                return Err(self.fail_protocol(e));
            }
        }

        if frames.saw_goodbye() {
            self.teardown(CloseReason::Goodbye);
        }
        Ok(())
    }

    /// Report the end of input.
    ///
    /// # Errors
    ///
    /// A protocol error if input stopped in the middle of a frame.
    pub async fn on_eof(&self) -> Result<()> {
        let mut frames = self.inner.frames.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        match frames.finish() {
            Ok(()) => {
                let reason = if frames.saw_goodbye() {
                    CloseReason::Goodbye
                } else {
                    CloseReason::EndOfStream
                };
                self.teardown(reason);
                Ok(())
            }
            Err(e) => Err(self.fail_protocol(e)),
        }
    }

    /// Close the session.
    ///
    /// Pending calls fail with `ConnectionClosed`, handler inputs end,
    /// goodbye is sent if configured and the write half is shut down.
    /// Resolves once the writer task has finished.
    pub async fn close(&self) {
        self.teardown(CloseReason::Local);
        wait_for_flag(&mut self.inner.writer_done.subscribe()).await;
    }

    /// Wait until the session is closed, by either side.
    pub async fn closed(&self) {
        wait_for_flag(&mut self.inner.closed.subscribe()).await;
    }

    /// True once the session is closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Number of outbound calls awaiting replies.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.lock().outbound.len()
    }

    fn fail_protocol(&self, error: MuxrpcError) -> MuxrpcError {
        self.inner.observer.protocol_error(&error);
        self.teardown(CloseReason::ProtocolError(error.to_string()));
        error
    }

    /// Fail everything and stop both directions. Runs once.
    fn teardown(&self, reason: CloseReason) {
        let (outbound, inbound) = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            (
                std::mem::take(&mut table.outbound),
                std::mem::take(&mut table.inbound),
            )
        };

        for (request_id, pending) in outbound {
            self.inner.observer.call_completed(
                request_id,
                &pending.method,
                &CallOutcome::Cancelled,
                pending.started.elapsed(),
            );
            pending.reply.fail(MuxrpcError::ConnectionClosed);
        }
        for (_, call) in inbound {
            if let Some(input) = call.input {
                let _ = input.send(Err(MuxrpcError::ConnectionClosed));
            }
        }

        let goodbye = self.inner.config.goodbye_on_close && reason == CloseReason::Local;
        self.inner.writer.close(goodbye);
        self.inner.closed.send_replace(true);
        self.inner.observer.session_closed(&reason);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

fn unexpected_call(call: &Call, wanted: CallKind) -> MuxrpcError {
    MuxrpcError::Usage(format!("expected a {wanted} call, got {}", call.kind()))
}

async fn wait_for_flag(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Read bytes until EOF, an error, or the session closing.
async fn read_loop<R>(session: Session, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut closed = session.inner.closed.subscribe();
    let mut buf = vec![0u8; session.inner.config.read_buffer_size.max(HEADER_SIZE)];

    loop {
        let read = tokio::select! {
            _ = wait_for_flag(&mut closed) => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                let _ = session.on_eof().await;
                return;
            }
            Ok(n) => {
                if session.on_bytes(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "read failed");
                session.teardown(CloseReason::TransportError(e.to_string()));
                return;
            }
        }
    }
}
