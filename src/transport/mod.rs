//! Transport module - byte streams a session can run over.
//!
//! Any `AsyncRead + AsyncWrite` works. This module adds:
//! - [`stdio()`] - process stdin/stdout
//! - [`PipeListener`] / [`PipeStream`] - Unix domain sockets (unix only)

#[cfg(unix)]
mod pipe;
mod stdio;

#[cfg(unix)]
pub use pipe::{generate_pipe_path, PipeListener, PipeStream};
pub use stdio::{stdio, StdioTransport};
