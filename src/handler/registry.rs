//! Method registry.
//!
//! The registry maps dotted method names to a call kind and, for methods
//! served locally, a handler. Methods the remote side serves are declared
//! without a handler so calls to them can be checked before sending.
//!
//! # Example
//!
//! ```
//! use muxrpc::{CallKind, HandlerError, MethodRegistry};
//!
//! let mut registry = MethodRegistry::new();
//!
//! registry
//!     .register_async("hello", |(a, b): (String, String)| async move {
//!         Ok::<_, HandlerError>(format!("hello, {a} and {b}!"))
//!     })
//!     .unwrap();
//! registry.declare("stuff", CallKind::Source).unwrap();
//!
//! assert_eq!(registry.kind_of("hello"), Some(CallKind::Async));
//! assert!(registry.resolve("stuff", CallKind::Async).is_err());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{CallKind, Manifest, RequestContext};
use crate::call::Source;
use crate::codec::Body;
use crate::error::{HandlerError, MuxrpcError, Result};

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
///
/// Handlers get the raw argument array and the context to answer through.
/// Returning an error sends it as an error frame unless the handler
/// already finished the call.
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbound call.
    fn call(&self, args: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Decode the positional argument array.
///
/// The whole array is tried first, so tuples and sequences map directly.
/// Otherwise a single argument decodes into `T` and no arguments decode
/// as `null`, which lets `()` and plain values work as argument types.
pub fn decode_args<T: DeserializeOwned>(args: Value) -> std::result::Result<T, HandlerError> {
    let first_error = match serde_json::from_value::<T>(args.clone()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    let fallback = match args {
        Value::Array(mut items) if items.len() == 1 => items.pop().unwrap_or(Value::Null),
        Value::Array(items) if items.is_empty() => Value::Null,
        _ => return Err(invalid_args(first_error)),
    };
    serde_json::from_value(fallback).map_err(|_| invalid_args(first_error))
}

fn invalid_args(err: serde_json::Error) -> HandlerError {
    HandlerError::new(format!("invalid arguments: {err}"))
}

/// Handler taking decoded arguments and the request context.
pub struct ContextHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> ContextHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a handler function.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for ContextHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

/// Async method: one value in, one value out.
struct AsyncFn<F, T, Fut, R> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (Fut, R)>,
}

impl<F, T, Fut, R> Handler for AsyncFn<F, T, Fut, R>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, args: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let value = fut.await?;
            // Encoded before awaiting so `R` need not be `Sync`
            let body = Body::json(&value)?;
            ctx.respond_body(body).await?;
            Ok(())
        })
    }
}

/// Source method: one value in, a finite stream out.
struct SourceFn<F, T, S, R> {
    handler: F,
    _phantom: PhantomData<fn(T) -> (S, R)>,
}

impl<F, T, S, R> Handler for SourceFn<F, T, S, R>
where
    F: Fn(T) -> S + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = std::result::Result<R, HandlerError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, args: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let stream = (self.handler)(parsed);
        Box::pin(async move {
            let mut stream = Box::pin(stream);
            while let Some(item) = stream.next().await {
                let body = Body::json(&item?)?;
                ctx.chunk_body(body).await?;
            }
            ctx.end().await?;
            Ok(())
        })
    }
}

/// Sink method: arguments plus the caller's stream.
struct SinkFn<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> Handler for SinkFn<F, T, Fut>
where
    F: Fn(T, Source) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, args: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let Some(input) = ctx.take_input() else {
            return Box::pin(async { Err(HandlerError::new("sink input already taken")) });
        };

        let fut = (self.handler)(parsed, input);
        Box::pin(async move {
            fut.await?;
            ctx.end().await?;
            Ok(())
        })
    }
}

/// Entry for a registered method.
#[derive(Clone)]
struct MethodEntry {
    kind: CallKind,
    handler: Option<Arc<dyn Handler>>,
}

/// Registry mapping method names to kinds and handlers.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodEntry>,
}

impl MethodRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method.
    ///
    /// `None` declares a method served by the remote side.
    ///
    /// # Errors
    ///
    /// `InvalidMethodName` for an empty name or empty segment,
    /// `DuplicateMethod` if the name is taken.
    pub fn register(
        &mut self,
        name: &str,
        kind: CallKind,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<()> {
        validate_name(name)?;
        if self.methods.contains_key(name) {
            return Err(MuxrpcError::DuplicateMethod(name.to_string()));
        }
        self.methods
            .insert(name.to_string(), MethodEntry { kind, handler });
        Ok(())
    }

    /// Declare a remote method.
    pub fn declare(&mut self, name: &str, kind: CallKind) -> Result<()> {
        self.register(name, kind, None)
    }

    /// Declare every method of a remote manifest.
    pub fn declare_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        for (name, kind) in manifest.iter() {
            self.declare(name, kind)?;
        }
        Ok(())
    }

    /// Register an async method.
    pub fn register_async<F, T, Fut, R>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let handler = AsyncFn {
            handler,
            _phantom: PhantomData,
        };
        self.register(name, CallKind::Async, Some(Arc::new(handler)))
    }

    /// Register a source method.
    pub fn register_source<F, T, S, R>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        S: Stream<Item = std::result::Result<R, HandlerError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let handler = SourceFn {
            handler,
            _phantom: PhantomData,
        };
        self.register(name, CallKind::Source, Some(Arc::new(handler)))
    }

    /// Register a sink method. The call ends once the handler returns.
    pub fn register_sink<F, T, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T, Source) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = SinkFn {
            handler,
            _phantom: PhantomData,
        };
        self.register(name, CallKind::Sink, Some(Arc::new(handler)))
    }

    /// Register a duplex method. Use `ctx.take_input()` for the incoming
    /// half and `ctx.chunk()`/`ctx.end()` for the outgoing one.
    pub fn register_duplex<F, T, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_with_context(name, CallKind::Duplex, handler)
    }

    /// Register a handler of any kind that answers through the context.
    pub fn register_with_context<F, T, Fut>(
        &mut self,
        name: &str,
        kind: CallKind,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, kind, Some(Arc::new(ContextHandler::new(handler))))
    }

    /// Kind and handler of a method.
    pub fn lookup(&self, name: &str) -> Option<(CallKind, Option<Arc<dyn Handler>>)> {
        self.methods
            .get(name)
            .map(|e| (e.kind, e.handler.clone()))
    }

    /// Kind of a method.
    pub fn kind_of(&self, name: &str) -> Option<CallKind> {
        self.methods.get(name).map(|e| e.kind)
    }

    /// True if the method has a local handler.
    pub fn has_handler(&self, name: &str) -> bool {
        self.methods
            .get(name)
            .is_some_and(|e| e.handler.is_some())
    }

    /// Check a call before anything is sent.
    ///
    /// # Errors
    ///
    /// `MethodNotFound` if undeclared, `KindMismatch` if declared with
    /// another kind.
    pub fn resolve(&self, name: &str, kind: CallKind) -> Result<()> {
        let declared = self
            .kind_of(name)
            .ok_or_else(|| MuxrpcError::MethodNotFound(name.to_string()))?;
        if declared != kind {
            return Err(MuxrpcError::KindMismatch {
                method: name.to_string(),
                declared,
                requested: kind,
            });
        }
        Ok(())
    }

    /// Manifest of the methods served locally.
    pub fn manifest(&self) -> Manifest {
        self.methods
            .iter()
            .filter(|(_, e)| e.handler.is_some())
            .map(|(name, e)| (name.clone(), e.kind))
            .collect()
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(MuxrpcError::InvalidMethodName(name.to_string()));
    }
    Ok(())
}
