//! Handler module - method registration and request handling.
//!
//! Provides:
//! - [`MethodRegistry`] - maps method names to kinds and handlers
//! - [`RequestContext`] - lets handlers respond, stream and fail calls
//! - [`CallKind`] and [`Manifest`] - the muxrpc method declarations
//!
//! # Example
//!
//! ```
//! use muxrpc::{HandlerError, MethodRegistry};
//!
//! let mut registry = MethodRegistry::new();
//!
//! // Register an async method
//! registry
//!     .register_async("hello", |(a, b): (String, String)| async move {
//!         Ok::<_, HandlerError>(format!("hello, {a} and {b}!"))
//!     })
//!     .unwrap();
//!
//! // Register a source method
//! registry
//!     .register_source("stuff", |_: ()| {
//!         futures::stream::iter(["Bob", "Alice"].map(|s| Ok::<_, HandlerError>(s.to_string())))
//!     })
//!     .unwrap();
//! ```

mod context;
mod manifest;
mod registry;

pub use context::RequestContext;
pub use manifest::{CallKind, Manifest};
pub use registry::{
    decode_args, BoxFuture, ContextHandler, Handler, HandlerResult, MethodRegistry,
};
