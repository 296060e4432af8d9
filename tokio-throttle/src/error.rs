//! Error types surfaced by the throttling adapters.
//!
//! Pacing failures travel inside `io::Error` so throttled streams stay drop-in
//! `AsyncWrite` implementations. Use [`ThrottleCanceled::from_io_error`] to recover the
//! number of bytes that reached the transport before the wait was abandoned.
use std::io;

/// Why a token wait was abandoned before enough units accrued.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Canceled {
    /// The scope's cancellation token fired.
    #[error("throttle wait aborted")]
    Aborted,
    /// The scope's deadline elapsed.
    #[error("throttle wait deadline exceeded")]
    DeadlineExceeded,
}

impl Canceled {
    fn kind(self) -> io::ErrorKind {
        match self {
            Canceled::Aborted => io::ErrorKind::Other,
            Canceled::DeadlineExceeded => io::ErrorKind::TimedOut,
        }
    }
}

/// A write reached the transport but its pacing wait was canceled.
///
/// The bytes are not un-sent: `written` is exactly what the inner stream accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{cause} after {written} bytes were written")]
pub struct ThrottleCanceled {
    pub written: usize,
    #[source]
    pub cause: Canceled,
}

impl ThrottleCanceled {
    /// Look for a `ThrottleCanceled` carried by `err`.
    pub fn from_io_error(err: &io::Error) -> Option<&ThrottleCanceled> {
        err.get_ref()?.downcast_ref::<ThrottleCanceled>()
    }
}

impl From<ThrottleCanceled> for io::Error {
    fn from(err: ThrottleCanceled) -> Self {
        io::Error::new(err.cause.kind(), err)
    }
}

/// Marker error returned by I/O on a connection that was already shut down.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("throttled connection is closed")]
pub struct ConnectionClosed;

impl From<ConnectionClosed> for io::Error {
    fn from(err: ConnectionClosed) -> Self {
        io::Error::new(io::ErrorKind::NotConnected, err)
    }
}

/// Rejected bucket configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("burst capacity must be positive")]
    ZeroBurst,
}
