//! Cancellation scopes bounding how long a throttled write may wait for tokens.
//!
//! A [`CancelScope`] pairs a [`CancellationToken`] with an optional deadline. Firing either
//! one unblocks every pending token wait bound to the scope with a [`Canceled`] outcome.
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_throttle::scope::CancelScope;
//!
//! let root = CancelScope::new();
//! let conn = root.child().with_timeout(Duration::from_secs(3));
//!
//! root.cancel(); // aborts waits in `conn` as well
//! assert!(conn.is_cancelled());
//! ```
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;

#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    /// A scope that only fires when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind waits to an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Fail waits that are still pending at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a scope that fires with this one but can also be canceled on its own.
    ///
    /// The deadline is inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deadline of this scope, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Abort every wait bound to this scope or its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `true` once canceled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Resolves once the scope fires, reporting which side fired.
    pub async fn cancelled(&self) -> Canceled {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Canceled::Aborted,
                _ = sleep_until(deadline) => Canceled::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Canceled::Aborted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_as_deadline_exceeded() {
        let scope = CancelScope::new().with_timeout(Duration::from_millis(250));
        assert!(!scope.is_cancelled());

        let start = Instant::now();
        assert_eq!(scope.cancelled().await, Canceled::DeadlineExceeded);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert!(scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn token_wins_over_later_deadline() {
        let scope = CancelScope::new().with_timeout(Duration::from_secs(10));
        let trigger = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_eq!(scope.cancelled().await, Canceled::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelScope::new();
        let a = parent.child();
        let b = parent.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!parent.is_cancelled());

        parent.cancel();
        assert!(b.is_cancelled());
        assert_eq!(b.cancelled().await, Canceled::Aborted);
    }
}
