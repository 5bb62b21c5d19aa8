//! Process stdin/stdout as one duplex stream.
//!
//! # Important
//!
//! - **stdout** carries muxrpc frames, nothing else may write to it
//! - **stderr** is for logs
//! - Never use `println!` in a process serving muxrpc over stdio

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};

/// Stdin for reading, stdout for writing.
pub struct StdioTransport {
    stdin: Stdin,
    stdout: Stdout,
}

/// Open the process stdio as a duplex stream.
pub fn stdio() -> StdioTransport {
    StdioTransport {
        stdin: tokio::io::stdin(),
        stdout: tokio::io::stdout(),
    }
}

impl AsyncRead for StdioTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

impl StdioTransport {
    /// Separate halves for [`SessionBuilder::spawn_split`](crate::SessionBuilder::spawn_split).
    pub fn into_split(self) -> (Stdin, Stdout) {
        (self.stdin, self.stdout)
    }
}
