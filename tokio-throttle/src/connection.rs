//! Write-throttled connections.
//!
//! [`ThrottledConnection`] wraps one accepted stream. Every write is forwarded to the inner
//! stream first; the call then completes only after the written byte count has been paced by
//! two token buckets:
//!
//! 1. the connection's private bucket (per-connection cap), then
//! 2. the listener's shared bucket (global cap), read live on every write.
//!
//! Either cap may be unlimited. Reads, flushes and shutdowns pass through untouched.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio_throttle::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = ThrottledListener::bind("127.0.0.1:7777").await?;
//! listener.set_limits(96 * 1024, 32 * 1024);
//!
//! let (mut conn, _addr) = listener.accept().await?;
//! conn.write_all(&[0u8; 64 * 1024]).await?; // paced at 32 KiB/s
//! conn.set_limit(8 * 1024);                  // retune only this connection
//! # Ok(()) }
//! ```
//!
//! ## Pacing happens after the transport write
//! The limiter paces how fast the *caller* can push the next chunk, not the moment bytes leave
//! the socket buffer. If a pacing wait is canceled by the connection's [`CancelScope`], the
//! write fails with a [`ThrottleCanceled`] that still reports the bytes already written.
//!
//! While a write is pending on pacing, the connection keeps a copy of the bytes it handed to
//! the transport. A re-poll whose buffer starts with those bytes completes with their count.
//! Any other call means the pending write was abandoned: its bytes are already on the wire, so
//! its pacing is paid first and the new buffer is then written in full. `poll_flush` and
//! `poll_shutdown` pay pacing left behind by an abandoned write before touching the stream.
use std::{
    fmt, io,
    num::NonZeroU64,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use crate::{
    bucket::{Limit, TokenBucket, DEFAULT_BURST},
    error::{Canceled, ConnectionClosed, ThrottleCanceled},
    io::ResetLinger,
    listener::Shared,
    scope::CancelScope,
};

/// Shareable handle to one connection's private bucket.
///
/// Clones retune the same connection, which lets a control task adjust a connection it does
/// not own. Buckets are replaced wholesale; a write already waiting keeps pacing against the
/// bucket it started with.
#[derive(Clone)]
pub struct LimitHandle {
    slot: Arc<Mutex<Arc<TokenBucket>>>,
    burst: NonZeroU64,
}

impl LimitHandle {
    fn new(limit: Limit, burst: NonZeroU64) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Arc::new(TokenBucket::new(limit)))),
            burst,
        }
    }

    /// Cap the connection at `bytes_per_sec`. `0` is ignored and keeps the current cap.
    pub fn set(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            debug!("ignoring non-positive connection limit");
            return;
        }

        self.replace(Limit::with_burst(bytes_per_sec, self.burst));
    }

    /// Swap in a fresh bucket paced by `limit`, [`Limit::Unlimited`] included.
    pub fn replace(&self, limit: Limit) {
        *self.slot.lock() = Arc::new(TokenBucket::new(limit));
        debug!(%limit, "connection limit replaced");
    }

    /// The cap currently applied to this connection.
    pub fn limit(&self) -> Limit {
        self.bucket().limit()
    }

    fn bucket(&self) -> Arc<TokenBucket> {
        self.slot.lock().clone()
    }
}

impl fmt::Debug for LimitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitHandle")
            .field("limit", &self.limit())
            .finish()
    }
}

type Wait = BoxFuture<'static, Result<(), Canceled>>;

struct Pacing {
    written: usize,
    // bytes handed to the transport whose count the caller has not seen yet
    unreported: Option<Vec<u8>>,
    wait: Wait,
}

/// A stream whose writes are paced by a per-connection and a listener-wide cap.
#[pin_project]
pub struct ThrottledConnection<T> {
    #[pin]
    inner: T,

    limiter: LimitHandle,
    shared: Arc<Shared>,
    scope: CancelScope,
    pacing: Option<Pacing>,
    closed: bool,
}

impl<T> ThrottledConnection<T> {
    pub(crate) fn new(inner: T, shared: Arc<Shared>, limit: Limit, scope: CancelScope) -> Self {
        let limiter = LimitHandle::new(limit, shared.burst());
        Self {
            inner,
            limiter,
            shared,
            scope,
            pacing: None,
            closed: false,
        }
    }

    /// Throttle a stream that does not belong to any listener.
    ///
    /// There is no global cap; `bytes_per_sec = 0` leaves the stream unlimited until
    /// [`set_limit`](Self::set_limit) is called.
    pub fn standalone(inner: T, bytes_per_sec: u64) -> Self {
        let shared = Arc::new(Shared::new(DEFAULT_BURST));
        Self::new(
            inner,
            shared,
            Limit::per_second(bytes_per_sec),
            CancelScope::new(),
        )
    }

    /// Replace this connection's cap. `0` is ignored and keeps the current cap.
    ///
    /// Neither the listener's default nor any other connection is affected.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        self.limiter.set(bytes_per_sec);
    }

    /// This connection's own cap.
    pub fn limit(&self) -> Limit {
        self.limiter.limit()
    }

    /// A cloneable handle retuning this connection from elsewhere.
    pub fn limit_handle(&self) -> LimitHandle {
        self.limiter.clone()
    }

    /// The listener-wide cap this connection currently shares.
    pub fn global_limit(&self) -> Limit {
        self.shared.global().limit()
    }

    /// Scope bounding this connection's pacing waits.
    pub fn cancel_scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Bind future pacing waits to `scope`. A wait already in progress keeps its old scope.
    pub fn set_cancel_scope(&mut self, scope: CancelScope) {
        self.scope = scope;
    }

    /// `true` once the write side has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Immutable access to the inner stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutable access to the inner stream. Writing through it bypasses pacing.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the wrapper, returning the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite + Unpin> ThrottledConnection<T> {
    /// Shut down the write side and release the stream.
    pub async fn close(mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

fn start_pacing(
    limiter: &LimitHandle,
    shared: &Arc<Shared>,
    scope: &CancelScope,
    written: usize,
) -> Option<Wait> {
    if written == 0 {
        return None;
    }

    let private = limiter.bucket();
    if private.is_unlimited() && shared.global().is_unlimited() {
        return None;
    }

    let shared = shared.clone();
    let scope = scope.clone();
    let units = written as u64;
    let wait = async move {
        private.wait_for(units, &scope).await?;
        // global cap is looked up only once the private one is satisfied
        let global = shared.global();
        global.wait_for(units, &scope).await
    }
    .boxed();

    Some(wait)
}

/// Settle the pacing left by an earlier write.
///
/// Resolves to `Some(n)` when `is_repoll` recognizes the caller's buffer as the pending write,
/// which then completes with its count. `None` means nothing is owed any more and the caller
/// may go ahead. A cancellation while paying for an abandoned write reports `written: 0`,
/// since nothing from the current call reached the transport.
fn poll_owed(
    pacing: &mut Option<Pacing>,
    cx: &mut Context<'_>,
    is_repoll: impl FnOnce(&[u8]) -> bool,
) -> Poll<io::Result<Option<usize>>> {
    let Some(current) = pacing.as_mut() else {
        return Poll::Ready(Ok(None));
    };

    let repoll = current.unreported.as_deref().is_some_and(is_repoll);
    if !repoll && current.unreported.take().is_some() {
        trace!(written = current.written, "pending write abandoned, pacing it first");
    }

    let res = ready!(current.wait.poll_unpin(cx));
    let written = current.written;
    *pacing = None;

    Poll::Ready(match (res, repoll) {
        (Ok(()), true) => Ok(Some(written)),
        (Ok(()), false) => Ok(None),
        (Err(cause), true) => Err(ThrottleCanceled { written, cause }.into()),
        (Err(cause), false) => Err(ThrottleCanceled { written: 0, cause }.into()),
    })
}

/// Pace `written` bytes that just reached the transport.
///
/// A wait that cannot finish right away is parked together with a copy of the sent bytes so a
/// re-poll can be told apart from a new write.
fn poll_written(
    pacing: &mut Option<Pacing>,
    cx: &mut Context<'_>,
    wait: Option<Wait>,
    written: usize,
    sent: impl FnOnce() -> Vec<u8>,
) -> Poll<io::Result<usize>> {
    let Some(mut wait) = wait else {
        return Poll::Ready(Ok(written));
    };

    match wait.poll_unpin(cx) {
        Poll::Ready(Ok(())) => Poll::Ready(Ok(written)),
        Poll::Ready(Err(cause)) => Poll::Ready(Err(ThrottleCanceled { written, cause }.into())),
        Poll::Pending => {
            *pacing = Some(Pacing {
                written,
                unreported: Some(sent()),
                wait,
            });
            Poll::Pending
        }
    }
}

fn gather(bufs: &[io::IoSlice<'_>], n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    for buf in bufs {
        let take = (n - out.len()).min(buf.len());
        out.extend_from_slice(&buf[..take]);
        if out.len() == n {
            break;
        }
    }
    out
}

fn starts_with_vectored(bufs: &[io::IoSlice<'_>], prefix: &[u8]) -> bool {
    let mut rest = prefix;
    for buf in bufs {
        if rest.is_empty() {
            break;
        }
        let take = rest.len().min(buf.len());
        if buf[..take] != rest[..take] {
            return false;
        }
        rest = &rest[take..];
    }
    rest.is_empty()
}

impl<T: ResetLinger> ResetLinger for ThrottledConnection<T> {
    fn set_reset_linger(&mut self) -> io::Result<()> {
        self.inner.set_reset_linger()
    }
}

impl<T: AsyncRead> AsyncRead for ThrottledConnection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<T: AsyncBufRead> AsyncBufRead for ThrottledConnection<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.project().inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.project().inner.consume(amt)
    }
}

impl<T: AsyncWrite> AsyncWrite for ThrottledConnection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        if *this.closed {
            return Poll::Ready(Err(ConnectionClosed.into()));
        }

        let owed = poll_owed(this.pacing, cx, |sent| buf.starts_with(sent));
        if let Some(written) = ready!(owed)? {
            return Poll::Ready(Ok(written));
        }

        let written = ready!(this.inner.as_mut().poll_write(cx, buf))?;
        let wait = start_pacing(this.limiter, this.shared, this.scope, written);
        poll_written(this.pacing, cx, wait, written, || buf[..written].to_vec())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.closed {
            return Poll::Ready(Err(ConnectionClosed.into()));
        }
        ready!(poll_owed(this.pacing, cx, |_| false))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.closed {
            return Poll::Ready(Err(ConnectionClosed.into()));
        }
        ready!(poll_owed(this.pacing, cx, |_| false))?;
        ready!(this.inner.poll_shutdown(cx))?;
        *this.closed = true;
        Poll::Ready(Ok(()))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        if *this.closed {
            return Poll::Ready(Err(ConnectionClosed.into()));
        }

        let owed = poll_owed(this.pacing, cx, |sent| starts_with_vectored(bufs, sent));
        if let Some(written) = ready!(owed)? {
            return Poll::Ready(Ok(written));
        }

        let written = ready!(this.inner.as_mut().poll_write_vectored(cx, bufs))?;
        let wait = start_pacing(this.limiter, this.shared, this.scope, written);
        poll_written(this.pacing, cx, wait, written, || gather(bufs, written))
    }
}

impl<T: fmt::Debug> fmt::Debug for ThrottledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledConnection")
            .field("inner", &self.inner)
            .field("limit", &self.limiter.limit())
            .field("closed", &self.closed)
            .finish()
    }
}
