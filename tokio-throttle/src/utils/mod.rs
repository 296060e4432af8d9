//! Helpers for observing throttled streams.
pub mod meter;
