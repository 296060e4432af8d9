//! Transport traits and extension helpers.
//!
//! - [`Accept`] abstracts the raw listener a [`ThrottledListener`] decorates. It is implemented
//!   for Tokio's `TcpListener` and (on Unix) `UnixListener`; implement it for any other source
//!   of streams, e.g. an in-memory listener in tests.
//! - [`ResetLinger`] requests an abortive close on streams that support it.
//! - [`ThrottleListenerExt`] and [`ThrottleWriteExt`] bolt the adapters onto existing values.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::{TcpListener, TcpStream};
//! use tokio_throttle::io::{ThrottleListenerExt, ThrottleWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:0").await?.throttled_with(4096, 1024);
//!
//! let mut upload = TcpStream::connect("127.0.0.1:9000").await?.throttle_writes(512);
//! upload.write_all(b"paced at 512 B/s").await?;
//! # drop(listener);
//! # Ok(()) }
//! ```
use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
    time,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader, BufStream, BufWriter, DuplexStream},
    net::{TcpListener, TcpStream},
};

use crate::{connection::ThrottledConnection, listener::ThrottledListener};

/// A source of accepted streams.
pub trait Accept {
    type Io: AsyncRead + AsyncWrite;
    type Addr;

    /// Poll for the next connection.
    ///
    /// Returns `Poll::Pending` and arranges a wake-up on `cx` when nothing is queued.
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>>;
}

impl Accept for TcpListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)>> {
        tokio::net::UnixListener::poll_accept(self, cx)
    }
}

/// Request abortive close (RST-on-close) semantics where supported.
///
/// On TCP, setting `SO_LINGER{on=1, linger=0}` makes the kernel send a **RST** when the socket
/// is closed instead of a graceful FIN/ACK shutdown. Useful to drop a client whose throttled
/// writes were canceled without draining what is still buffered.
///
/// Types where linger is meaningless implement this as a no-op returning `Ok(())`.
pub trait ResetLinger {
    fn set_reset_linger(&mut self) -> io::Result<()>;
}

impl ResetLinger for TcpStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        TcpStream::set_linger(self, Some(time::Duration::from_secs(0)))
    }
}

#[cfg(unix)]
impl ResetLinger for tokio::net::UnixStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<RW: AsyncRead + AsyncWrite + ResetLinger> ResetLinger for BufStream<RW> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.get_mut().set_reset_linger()
    }
}

impl<R: AsyncRead + ResetLinger> ResetLinger for BufReader<R> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.get_mut().set_reset_linger()
    }
}

impl<W: AsyncWrite + ResetLinger> ResetLinger for BufWriter<W> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.get_mut().set_reset_linger()
    }
}

impl ResetLinger for DuplexStream {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Listener-side ergonomics: wrap any [`Accept`] in a [`ThrottledListener`].
pub trait ThrottleListenerExt: Accept {
    /// Wrap with both caps unlimited.
    #[must_use]
    fn throttled(self) -> ThrottledListener<Self>
    where
        Self: Sized,
    {
        ThrottledListener::new(self)
    }

    /// Wrap with a global cap and a default per-connection cap (bytes/second, `0` = unlimited).
    #[must_use]
    fn throttled_with(self, global: u64, per_connection: u64) -> ThrottledListener<Self>
    where
        Self: Sized,
    {
        let listener = ThrottledListener::new(self);
        listener.set_limits(global, per_connection);
        listener
    }
}

impl<L: Accept> ThrottleListenerExt for L {}

/// Write-side ergonomics for streams that do not come from a [`ThrottledListener`].
pub trait ThrottleWriteExt: AsyncWrite {
    /// Pace writes at `bytes_per_sec` (`0` = unlimited) with no global cap.
    #[must_use]
    fn throttle_writes(self, bytes_per_sec: u64) -> ThrottledConnection<Self>
    where
        Self: Sized,
    {
        ThrottledConnection::standalone(self, bytes_per_sec)
    }
}

impl<T: AsyncWrite> ThrottleWriteExt for T {}
