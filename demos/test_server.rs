//! Test server - a muxrpc peer to run other implementations against.
//!
//! Serves two methods:
//! - `hello` (async): `hello(a, b)` answers `"hello, a and b!"`
//! - `stuff` (source): yields `{a: 1}` through `{a: 4}`, then ends
//!
//! Runs over stdio by default. With `--socket <path>` it listens on a unix
//! socket and serves each connection as its own session.
//!
//! # Running with a JS peer
//!
//! ```js
//! const MRPC = require('muxrpc')
//! const toPull = require('stream-to-pull-stream')
//! const child = require('child_process').spawn('./target/debug/examples/test_server')
//!
//! const client = MRPC({ hello: 'async', stuff: 'source' }, null)()
//! const stream = client.stream
//! pull(toPull.source(child.stdout), stream, toPull.sink(child.stdin))
//!
//! client.hello('Bob', 'Alice', console.log) // hello, Bob and Alice!
//! ```
//!
//! Logs go to stderr. Set `RUST_LOG=muxrpc=debug` for frame-level detail.

use futures::stream;
use muxrpc::{HandlerError, Session, SessionBuilder};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn server() -> SessionBuilder {
    Session::builder()
        .handle_async("hello", |(a, b): (String, String)| async move {
            Ok::<_, HandlerError>(format!("hello, {a} and {b}!"))
        })
        .handle_source("stuff", |_: Value| {
            stream::iter((1..=4).map(|a| Ok::<_, HandlerError>(json!({ "a": a }))))
        })
        .serve_manifest(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (Some("--socket"), Some(path)) => serve_socket(&path).await,
        (None, _) => {
            let session = server().spawn(muxrpc::transport::stdio())?;
            session.closed().await;
            tracing::info!("stdio session closed");
            Ok(())
        }
        _ => Err("usage: test_server [--socket <path>]".into()),
    }
}

#[cfg(unix)]
async fn serve_socket(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    use muxrpc::transport::PipeListener;

    let listener = PipeListener::bind(path).await?;
    tracing::info!(path = listener.path(), "accepting connections");

    loop {
        let stream = listener.accept().await?;
        let session = server().spawn(stream)?;
        tokio::spawn(async move {
            session.closed().await;
            tracing::info!("connection closed");
        });
    }
}

#[cfg(not(unix))]
async fn serve_socket(_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    Err("unix sockets are not available on this platform".into())
}
