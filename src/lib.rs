//! # muxrpc
//!
//! Multiplexed RPC sessions over a single duplex byte stream.
//!
//! One session issues and serves many concurrent calls, each tagged with a
//! request id:
//!
//! - **async**: one request, one reply
//! - **source**: one request, a stream of replies, then an end
//! - **sink**: one request, a stream from the caller, then an end
//! - **duplex**: streams in both directions
//!
//! ## Architecture
//!
//! - **Framing**: 9-byte header (flags, body length, request id) + body
//! - **Reader**: one task decodes frames and routes them by request id
//! - **Writer**: one task drains a bounded queue and batches writes
//! - **Handlers**: each inbound call runs on its own task
//!
//! ## Example
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
//!         .declare("stuff", CallKind::Source)
//!         .spawn(muxrpc::transport::stdio())?;
//!
//!     let names: Vec<String> = session.source("stuff", &()).await?.collect_as().await?;
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod error;
pub mod handler;
pub mod observer;
pub mod protocol;
pub mod transport;
pub mod writer;

mod session;

pub use call::{AsyncResponse, Call, Duplex, Sink, Source};
pub use codec::Body;
pub use error::{ErrorClass, HandlerError, MuxrpcError, RemoteError, Result};
pub use handler::{CallKind, HandlerResult, Manifest, MethodRegistry, RequestContext};
pub use observer::{CallOutcome, CloseReason, SessionObserver, TracingObserver};
pub use session::{
    Session, SessionBuilder, SessionConfig, DEFAULT_MAX_CONCURRENT_HANDLERS,
    DEFAULT_READ_BUFFER_SIZE, MANIFEST_METHOD,
};
