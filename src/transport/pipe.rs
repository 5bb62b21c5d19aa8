//! Unix domain socket listener.
//!
//! Each accepted connection is a [`PipeStream`], a duplex byte stream ready
//! for [`SessionBuilder::spawn`](crate::SessionBuilder::spawn).
//!
//! # Example
//!
//! ```ignore
//! use muxrpc::transport::PipeListener;
//!
//! let listener = PipeListener::bind("/tmp/muxrpc.sock").await?;
//! loop {
//!     let stream = listener.accept().await?;
//!     let session = muxrpc::Session::builder().spawn(stream)?;
//! }
//! ```

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `{tmp}/muxrpc-{pid}-{random}.sock`
pub fn generate_pipe_path() -> String {
    let dir = std::env::temp_dir();
    let name = format!("muxrpc-{}-{:x}.sock", std::process::id(), rand_u64());
    dir.join(name).to_string_lossy().into_owned()
}

/// Cheap unique suffix from the clock and process id.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ seq.rotate_left(32)
}

/// Unix domain socket listener. The socket file is removed on drop.
pub struct PipeListener {
    listener: UnixListener,
    path: String,
}

impl PipeListener {
    /// Bind to a socket path, replacing a stale socket file.
    pub async fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::debug!(path, "listening");

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<PipeStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(PipeStream { stream })
    }

    /// Socket path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connected unix socket.
pub struct PipeStream {
    stream: UnixStream,
}

impl PipeStream {
    /// Connect to a listening socket.
    pub async fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self { stream })
    }

    /// Split into owned read and write halves for
    /// [`SessionBuilder::spawn_split`](crate::SessionBuilder::spawn_split).
    pub fn into_split(
        self,
    ) -> (
        tokio::net::unix::OwnedReadHalf,
        tokio::net::unix::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
