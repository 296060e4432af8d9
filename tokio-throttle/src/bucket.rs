//! Token bucket pacing primitive.
//!
//! A [`TokenBucket`] holds up to `burst` units and refills at `rate` units per second.
//! [`TokenBucket::wait_for`] suspends the caller until the requested number of units has been
//! taken, or until the caller's [`CancelScope`] fires.
//!
//! Rates are expressed in **bytes per second**. A rate of `0` is [`Limit::Unlimited`]: waits
//! return immediately and nothing is accounted.
//!
//! ```no_run
//! use tokio_throttle::bucket::{Limit, TokenBucket};
//! use tokio_throttle::scope::CancelScope;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bucket = TokenBucket::new(Limit::per_second(1024));
//! let scope = CancelScope::new();
//!
//! bucket.wait_for(1024, &scope).await.unwrap(); // fresh buckets start full
//! bucket.wait_for(512, &scope).await.unwrap();  // ~0.5s later
//! # }
//! ```
//!
//! ## Under the hood
//! - Refill is lazy: every check converts the elapsed [`tokio::time::Instant`] span into whole
//!   tokens. The refill timestamp only advances by the time those tokens cost, so fractional
//!   progress is never lost.
//! - Waiters queue on a fair async mutex. Only the head of the queue sleeps on the clock, which
//!   keeps waiters FIFO and rules out starvation under contention.
//! - The head takes whatever is available on each check and sleeps until the next batch is due,
//!   re-checking at least every 100ms so reconfiguration is picked up quickly. Units held by a
//!   waiter that gets canceled (or dropped) go back to the bucket.
//! - Requests larger than `burst` are served across several refills instead of deadlocking.
use std::{fmt, num::NonZeroU64, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::Mutex as FairMutex,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace};

use crate::{
    error::{Canceled, LimitError},
    scope::CancelScope,
};

/// Burst applied when none is given: 32 KiB, the default copy buffer size.
pub const DEFAULT_BURST: NonZeroU64 = match NonZeroU64::new(32 * 1024) {
    Some(burst) => burst,
    None => panic!("default burst must be positive"),
};

const MAX_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Pacing configuration of a bucket.
///
/// `Unlimited` is a distinct state rather than a zero rate: an unconfigured cap never blocks.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Limit {
    #[default]
    Unlimited,
    Limited { rate: NonZeroU64, burst: NonZeroU64 },
}

impl Limit {
    /// `rate` bytes per second with the [`DEFAULT_BURST`]. `0` means unlimited.
    pub fn per_second(rate: u64) -> Self {
        Self::with_burst(rate, DEFAULT_BURST)
    }

    /// `rate` bytes per second with an explicit burst. `0` means unlimited.
    pub fn with_burst(rate: u64, burst: NonZeroU64) -> Self {
        match NonZeroU64::new(rate) {
            Some(rate) => Limit::Limited { rate, burst },
            None => Limit::Unlimited,
        }
    }

    /// Rate in bytes per second, `0` when unlimited.
    pub fn rate(&self) -> u64 {
        match self {
            Limit::Unlimited => 0,
            Limit::Limited { rate, .. } => rate.get(),
        }
    }

    /// Burst in bytes, `None` when unlimited.
    pub fn burst(&self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Limited { burst, .. } => Some(burst.get()),
        }
    }

    /// `true` for a cap that never blocks.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Limited { rate, burst } => write!(f, "{rate} B/s (burst {burst} B)"),
        }
    }
}

struct State {
    limit: Limit,
    available: u64,
    last_refill: Instant,
}

impl State {
    fn new(limit: Limit) -> Self {
        Self {
            limit,
            available: limit.burst().unwrap_or(0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let Limit::Limited { rate, burst } = self.limit else {
            return;
        };

        let rate = rate.get() as u128;
        let since = now.saturating_duration_since(self.last_refill).as_nanos();
        let added = since * rate / NANOS_PER_SEC;
        if added == 0 {
            return;
        }

        let room = burst.get().saturating_sub(self.available) as u128;
        if added >= room {
            self.available = burst.get();
            self.last_refill = now;
        } else {
            self.available += added as u64;
            let spent = added * NANOS_PER_SEC / rate;
            self.last_refill += Duration::from_nanos(spent as u64);
        }
    }

    /// Instant at which `units` more tokens will have accrued.
    fn ready_at(&self, units: u64, rate: NonZeroU64) -> Instant {
        let rate = rate.get() as u128;
        let nanos = (units as u128 * NANOS_PER_SEC).div_ceil(rate);
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        self.last_refill + Duration::from_nanos(nanos)
    }

    fn give_back(&mut self, units: u64) {
        if let Limit::Limited { burst, .. } = self.limit {
            self.available = self.available.saturating_add(units).min(burst.get());
        }
    }
}

/// Capacity-bounded token counter with an async, cancelable wait.
pub struct TokenBucket {
    state: Mutex<State>,
    queue: FairMutex<()>,
}

impl TokenBucket {
    /// A full bucket paced by `limit`.
    pub fn new(limit: Limit) -> Self {
        Self {
            state: Mutex::new(State::new(limit)),
            queue: FairMutex::new(()),
        }
    }

    /// A bucket that never makes anyone wait.
    pub fn unlimited() -> Self {
        Self::new(Limit::Unlimited)
    }

    /// Current pacing configuration.
    pub fn limit(&self) -> Limit {
        self.state.lock().limit
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit().is_unlimited()
    }

    /// Tokens available right now, after refilling.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.available
    }

    /// Replace the `(rate, capacity)` pair in one step.
    ///
    /// Tokens accrued so far at the old rate are kept up to the new capacity; a bucket that
    /// was unlimited starts full. A `rate` of `0` switches the bucket to unlimited. Waiters
    /// pick up the new pair on their next check.
    pub fn configure(&self, rate: u64, capacity: u64) -> Result<(), LimitError> {
        let burst = NonZeroU64::new(capacity).ok_or(LimitError::ZeroBurst)?;
        let limit = Limit::with_burst(rate, burst);

        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill(now);
        state.available = match (state.limit, limit) {
            (_, Limit::Unlimited) => 0,
            (Limit::Unlimited, Limit::Limited { burst, .. }) => burst.get(),
            (Limit::Limited { .. }, Limit::Limited { burst, .. }) => {
                state.available.min(burst.get())
            }
        };
        state.last_refill = now;
        state.limit = limit;
        drop(state);

        debug!(%limit, "token bucket reconfigured");
        Ok(())
    }

    /// Take `units` tokens, waiting for them to accrue if necessary.
    ///
    /// Returns the scope's [`Canceled`] reason if it fires first; in that case every unit
    /// taken so far is returned to the bucket. Tokens that are already available are taken
    /// even when the scope has fired.
    pub async fn wait_for(&self, units: u64, scope: &CancelScope) -> Result<(), Canceled> {
        if units == 0 || self.is_unlimited() {
            return Ok(());
        }

        let _turn = tokio::select! {
            biased;
            turn = self.queue.lock() => turn,
            cause = scope.cancelled() => return Err(cause),
        };

        let mut held = Held {
            bucket: self,
            units: 0,
        };

        loop {
            let wake = {
                let mut state = self.state.lock();
                let now = Instant::now();
                state.refill(now);

                let Limit::Limited { rate, burst } = state.limit else {
                    // reconfigured to unlimited while queued
                    held.units = 0;
                    return Ok(());
                };

                let take = (units - held.units).min(state.available);
                state.available -= take;
                held.units += take;
                if held.units == units {
                    held.units = 0;
                    return Ok(());
                }

                let next = (units - held.units).min(burst.get());
                state.ready_at(next, rate).min(now + MAX_CHECK_INTERVAL)
            };

            trace!(units, held = held.units, "waiting for tokens");

            tokio::select! {
                biased;
                _ = sleep_until(wake) => {}
                cause = scope.cancelled() => return Err(cause),
            }
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("limit", &state.limit)
            .field("available", &state.available)
            .finish()
    }
}

/// Units taken by an unfinished wait; returned to the bucket on drop.
struct Held<'a> {
    bucket: &'a TokenBucket,
    units: u64,
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if self.units == 0 {
            return;
        }
        let mut state = self.bucket.state.lock();
        state.refill(Instant::now());
        state.give_back(self.units);
    }
}
