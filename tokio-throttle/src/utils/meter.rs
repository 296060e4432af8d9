//! Byte accounting for streams.
//!
//! [`ByteMeter`] wraps any `AsyncRead`/`AsyncWrite` and counts bytes in both directions into
//! shared [`MeterCounters`]. The counters outlive borrows of the stream, so a control task can
//! report throughput of a connection owned by another task.
//!
//! ## Example
//! ```no_run
//! use tokio::io::{self, duplex, AsyncReadExt, AsyncWriteExt};
//! use tokio_throttle::utils::meter::ByteMeter;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let (writer, mut reader) = duplex(64);
//! let mut writer = ByteMeter::new(writer);
//! let counters = writer.counters();
//!
//! writer.write_all(b"hello world").await?;
//! let mut buf = [0u8; 11];
//! reader.read_exact(&mut buf).await?;
//!
//! assert_eq!(counters.written(), 11);
//! assert!(counters.write_rate_bps().is_some());
//! # Ok(()) }
//! ```
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

use crate::io::ResetLinger;

/// Shared byte counters of one [`ByteMeter`].
///
/// The clock starts at the first non-empty transfer in either direction.
#[derive(Debug, Default)]
pub struct MeterCounters {
    read: AtomicU64,
    written: AtomicU64,
    start: OnceLock<Instant>,
}

impl MeterCounters {
    /// Total bytes read so far.
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Moment of the first non-empty transfer.
    pub fn start_instant(&self) -> Option<Instant> {
        self.start.get().copied()
    }

    /// Average outbound rate in bytes per second, `None` before the first transfer.
    pub fn write_rate_bps(&self) -> Option<f64> {
        self.rate(self.written())
    }

    /// Average inbound rate in bytes per second, `None` before the first transfer.
    pub fn read_rate_bps(&self) -> Option<f64> {
        self.rate(self.read())
    }

    fn rate(&self, total: u64) -> Option<f64> {
        let start = self.start_instant()?;
        // Clamp denominator to avoid FP blow-ups on extremely small intervals.
        let elapsed = start.elapsed().as_secs_f64().max(1e-6);
        Some(total as f64 / elapsed)
    }

    fn record(counter: &AtomicU64, start: &OnceLock<Instant>, n: usize) {
        if n == 0 {
            return;
        }
        start.get_or_init(Instant::now);
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Pass-through stream that counts the bytes it moves.
#[pin_project]
pub struct ByteMeter<T> {
    #[pin]
    inner: T,
    counters: Arc<MeterCounters>,
}

impl<T> ByteMeter<T> {
    /// Wrap `inner` with fresh counters.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            counters: Arc::default(),
        }
    }

    /// Shared handle to the counters.
    pub fn counters(&self) -> Arc<MeterCounters> {
        self.counters.clone()
    }

    /// Immutable access to the inner stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutable access to the inner stream. Bytes moved through it are not counted.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the meter, returning the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for ByteMeter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteMeter")
            .field("inner", &self.inner)
            .field("read", &self.counters.read())
            .field("written", &self.counters.written())
            .finish()
    }
}

impl<T: ResetLinger> ResetLinger for ByteMeter<T> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.inner.set_reset_linger()
    }
}

impl<T: AsyncRead> AsyncRead for ByteMeter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len().saturating_sub(before);
            MeterCounters::record(&this.counters.read, &this.counters.start, n);
        }
        res
    }
}

impl<T: AsyncWrite> AsyncWrite for ByteMeter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            MeterCounters::record(&this.counters.written, &this.counters.start, n);
        }
        res
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let res = this.inner.poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = res {
            MeterCounters::record(&this.counters.written, &this.counters.start, n);
        }
        res
    }
}
