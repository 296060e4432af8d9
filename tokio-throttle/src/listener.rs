//! Listener decorator owning the global cap and the default per-connection cap.
//!
//! [`ThrottledListener`] wraps any raw listener implementing [`Accept`] and turns every
//! accepted stream into a [`ThrottledConnection`]:
//!
//! - the **global** cap is a single token bucket shared by all connections accepted from this
//!   listener. Connections look it up on every write, so [`set_global_limit`] takes effect on
//!   connections already in flight;
//! - the **default per-connection** cap is captured at accept time. Changing it later only
//!   affects connections accepted afterwards.
//!
//! A limit of `0` is never applied: the setters treat it as "leave unchanged".
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio_throttle::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let listener = ThrottledListener::bind("127.0.0.1:7777").await?;
//! listener.set_limits(3000, 1000); // 3000 B/s shared, 1000 B/s per connection
//!
//! loop {
//!     let (mut conn, addr) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = conn.write_all(format!("hello {addr}\n").as_bytes()).await;
//!     });
//! }
//! # }
//! ```
//!
//! [`set_global_limit`]: ThrottledListener::set_global_limit
use std::{
    fmt, future, io,
    net::SocketAddr,
    num::NonZeroU64,
    sync::Arc,
    task::{ready, Context, Poll},
};

use parking_lot::Mutex;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, trace};

use crate::{
    bucket::{Limit, TokenBucket, DEFAULT_BURST},
    connection::ThrottledConnection,
    io::Accept,
    scope::CancelScope,
};

struct Limits {
    global: Arc<TokenBucket>,
    per_connection: Limit,
}

/// Limit state shared between a listener and the connections it accepted.
///
/// The lock is only held to swap or clone the bucket pointer, never across a wait.
pub(crate) struct Shared {
    limits: Mutex<Limits>,
    burst: NonZeroU64,
}

impl Shared {
    pub(crate) fn new(burst: NonZeroU64) -> Self {
        Self {
            limits: Mutex::new(Limits {
                global: Arc::new(TokenBucket::unlimited()),
                per_connection: Limit::Unlimited,
            }),
            burst,
        }
    }

    pub(crate) fn burst(&self) -> NonZeroU64 {
        self.burst
    }

    /// Current global bucket.
    pub(crate) fn global(&self) -> Arc<TokenBucket> {
        self.limits.lock().global.clone()
    }

    fn per_connection(&self) -> Limit {
        self.limits.lock().per_connection
    }

    fn update(&self, global: u64, per_connection: u64) {
        // Build the bucket before taking the lock so the swap is all the guard covers.
        let bucket = (global > 0).then(|| {
            Arc::new(TokenBucket::new(Limit::with_burst(global, self.burst)))
        });
        let per_connection = Limit::with_burst(per_connection, self.burst);

        let mut limits = self.limits.lock();
        if let Some(bucket) = bucket {
            limits.global = bucket;
        }
        if !per_connection.is_unlimited() {
            limits.per_connection = per_connection;
        }
    }
}

/// A listener whose accepted connections are write-throttled.
pub struct ThrottledListener<L> {
    inner: L,
    shared: Arc<Shared>,
    scope: CancelScope,
}

impl<L> ThrottledListener<L> {
    /// Wrap `inner` with both caps unlimited and the [`DEFAULT_BURST`].
    pub fn new(inner: L) -> Self {
        Self::with_burst(inner, DEFAULT_BURST)
    }

    /// Wrap `inner`; every bucket created for this listener allows bursts of `burst` bytes.
    pub fn with_burst(inner: L, burst: NonZeroU64) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared::new(burst)),
            scope: CancelScope::new(),
        }
    }

    /// Root scope for accepted connections.
    ///
    /// Each connection receives a child of `scope`: canceling the root aborts every pending
    /// pacing wait, canceling one connection's scope touches nothing else.
    #[must_use]
    pub fn with_cancel_scope(mut self, scope: CancelScope) -> Self {
        self.scope = scope;
        self
    }

    /// The root scope every accepted connection derives from.
    pub fn cancel_scope(&self) -> &CancelScope {
        &self.scope
    }

    /// Replace the bucket shared by all connections. `0` is ignored.
    ///
    /// Connections already accepted pace their next write against the new bucket.
    pub fn set_global_limit(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            debug!("ignoring non-positive global limit");
            return;
        }
        self.shared.update(bytes_per_sec, 0);
        debug!(rate = bytes_per_sec, "global limit replaced");
    }

    /// Cap applied to connections accepted from now on. `0` is ignored.
    pub fn set_default_connection_limit(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            debug!("ignoring non-positive default connection limit");
            return;
        }
        self.shared.update(0, bytes_per_sec);
        debug!(rate = bytes_per_sec, "default connection limit updated");
    }

    /// Set both caps at once; a `0` leaves the corresponding cap unchanged.
    pub fn set_limits(&self, global: u64, per_connection: u64) {
        self.shared.update(global, per_connection);
        debug!(global, per_connection, "listener limits updated");
    }

    /// The cap shared by all connections.
    pub fn global_limit(&self) -> Limit {
        self.shared.global().limit()
    }

    /// The cap the next accepted connection starts with.
    pub fn default_connection_limit(&self) -> Limit {
        self.shared.per_connection()
    }

    /// Burst of every bucket this listener creates.
    pub fn burst(&self) -> NonZeroU64 {
        self.shared.burst()
    }

    /// Immutable access to the raw listener.
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    /// Release the raw listener. Connections already accepted stay open.
    pub fn close(self) -> io::Result<()> {
        drop(self.inner);
        Ok(())
    }

    fn wrap<T>(&self, io: T) -> ThrottledConnection<T> {
        let limit = self.shared.per_connection();
        ThrottledConnection::new(io, self.shared.clone(), limit, self.scope.child())
    }
}

impl<L: Accept> ThrottledListener<L> {
    /// Accept the next raw connection and wrap it with the current default cap.
    ///
    /// Errors from the raw listener are returned as-is.
    pub async fn accept(&self) -> io::Result<(ThrottledConnection<L::Io>, L::Addr)> {
        future::poll_fn(|cx| self.poll_accept(cx)).await
    }

    /// Poll-based [`accept`](Self::accept), for use inside hand-written futures.
    pub fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(ThrottledConnection<L::Io>, L::Addr)>> {
        let (io, addr) = ready!(self.inner.poll_accept(cx))?;
        let conn = self.wrap(io);
        trace!(limit = %conn.limit(), "connection accepted");
        Poll::Ready(Ok((conn, addr)))
    }
}

impl ThrottledListener<TcpListener> {
    /// Bind a TCP listener and wrap it.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        TcpListener::bind(addr).await.map(Self::new)
    }

    /// Address the TCP listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<L: fmt::Debug> fmt::Debug for ThrottledListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledListener")
            .field("inner", &self.inner)
            .field("global", &self.global_limit())
            .field("per_connection", &self.default_connection_limit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_listener_is_unlimited() {
        let listener = ThrottledListener::new(());
        assert!(listener.global_limit().is_unlimited());
        assert!(listener.default_connection_limit().is_unlimited());
        assert_eq!(listener.burst(), DEFAULT_BURST);
    }

    #[test]
    fn zero_limits_leave_configuration_unchanged() {
        let listener = ThrottledListener::new(());
        listener.set_limits(3000, 1000);

        listener.set_global_limit(0);
        listener.set_default_connection_limit(0);
        listener.set_limits(0, 0);

        assert_eq!(listener.global_limit().rate(), 3000);
        assert_eq!(listener.default_connection_limit().rate(), 1000);
    }

    #[test]
    fn set_limits_halves_are_independent() {
        let listener = ThrottledListener::new(());
        listener.set_limits(0, 1000);
        assert!(listener.global_limit().is_unlimited());
        assert_eq!(listener.default_connection_limit().rate(), 1000);

        listener.set_limits(5000, 0);
        assert_eq!(listener.global_limit().rate(), 5000);
        assert_eq!(listener.default_connection_limit().rate(), 1000);
    }

    #[test]
    fn global_limit_replaces_the_bucket() {
        let listener =
            ThrottledListener::with_burst((), NonZeroU64::new(1024).unwrap());
        listener.set_global_limit(100);
        let before = listener.shared.global();

        listener.set_global_limit(200);
        let after = listener.shared.global();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.limit().rate(), 100);
        assert_eq!(after.limit().rate(), 200);
        assert_eq!(after.limit().burst(), Some(1024));
    }

    #[test]
    fn wrapped_connections_capture_the_default_at_wrap_time() {
        let listener = ThrottledListener::new(());
        listener.set_default_connection_limit(1000);
        let first = listener.wrap(());

        listener.set_default_connection_limit(4000);
        let second = listener.wrap(());

        assert_eq!(first.limit().rate(), 1000);
        assert_eq!(second.limit().rate(), 4000);
    }

    #[test]
    fn connection_scopes_are_children_of_the_listener_scope() {
        let listener = ThrottledListener::new(()).with_cancel_scope(CancelScope::new());
        let a = listener.wrap(());
        let b = listener.wrap(());

        a.cancel_scope().cancel();
        assert!(!b.cancel_scope().is_cancelled());

        listener.cancel_scope().cancel();
        assert!(b.cancel_scope().is_cancelled());
    }
}
