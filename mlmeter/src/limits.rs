//! Request rate limiting.
//!
//! [`RateLimiter`] bounds how many operations one identity may perform within a trailing time
//! window. Each identity owns the timestamps of its admitted requests; entries that fall out of
//! the window are purged lazily on every check. The window is half-open: a request made exactly
//! `window_seconds` ago no longer counts.
//!
//! The limiter is purely temporal and knows nothing about token balances.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error as ThisError;
use tracing::{debug, instrument};

use crate::config::RateLimitConfig;
use crate::types::Identity;

/// Rejection raised when an identity has used up its window.
///
/// The rejected attempt is not recorded.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("Rate limit exceeded. Maximum {limit} requests per {window_seconds} seconds. Try again in {retry_after} seconds.")]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub window_seconds: u64,
    /// Seconds until the oldest request in the window expires
    pub retry_after: u64,
    pub reset_at: DateTime<Utc>,
}

/// Snapshot of one identity's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    /// When the oldest counted request leaves the window (None for an empty window)
    pub reset_at: Option<DateTime<Utc>>,
}

/// Sliding-window request counter keyed by identity.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window_seconds: u64,
    window: TimeDelta,
    windows: DashMap<Identity, VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Creates a limiter from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.max_requests, config.window_seconds)
    }

    pub fn with_limits(max_requests: u32, window_seconds: u64) -> Self {
        let window = i64::try_from(window_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        Self {
            max_requests,
            window_seconds,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Admit and record a request made at `now`, or reject it.
    ///
    /// Purge, count and append happen under the lock of the shard owning `identity`, so
    /// concurrent checks for one identity can never admit more than `max_requests`.
    #[instrument(skip(self, now))]
    pub fn check_and_record(&self, identity: &str, now: DateTime<Utc>) -> Result<RateLimitStatus, RateLimitExceeded> {
        let mut timestamps = self.windows.entry(identity.to_string()).or_default();
        self.purge(&mut timestamps, now);

        let used = timestamps.len() as u32;
        if used >= self.max_requests {
            let reset_at = self.reset_at(&timestamps).unwrap_or(DateTime::<Utc>::MAX_UTC);
            let retry_after = ceil_seconds(reset_at - now);
            debug!(used, retry_after, "Rate limit exceeded");
            return Err(RateLimitExceeded {
                limit: self.max_requests,
                window_seconds: self.window_seconds,
                retry_after,
                reset_at,
            });
        }

        timestamps.push_back(now);
        Ok(RateLimitStatus {
            limit: self.max_requests,
            used: used + 1,
            remaining: self.max_requests - used - 1,
            window_seconds: self.window_seconds,
            reset_at: self.reset_at(&timestamps),
        })
    }

    /// Report the window state at `now` without recording anything.
    pub fn inspect(&self, identity: &str, now: DateTime<Utc>) -> RateLimitStatus {
        // get_mut never creates a window for an unseen identity
        let (used, reset_at) = match self.windows.get_mut(identity) {
            Some(mut timestamps) => {
                self.purge(&mut timestamps, now);
                (timestamps.len() as u32, self.reset_at(&timestamps))
            }
            None => (0, None),
        };

        RateLimitStatus {
            limit: self.max_requests,
            used,
            remaining: self.max_requests.saturating_sub(used),
            window_seconds: self.window_seconds,
            reset_at,
        }
    }

    /// Discard the whole window of `identity`, e.g. when its account is removed.
    pub fn forget(&self, identity: &str) {
        if self.windows.remove(identity).is_some() {
            debug!(identity, "Rate limit window discarded");
        }
    }

    /// Drop every timestamp at or before `now - window`.
    fn purge(&self, timestamps: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        if let Some(cutoff) = now.checked_sub_signed(self.window) {
            timestamps.retain(|t| *t > cutoff);
        }
    }

    fn reset_at(&self, timestamps: &VecDeque<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        // Concurrent callers may record slightly out of order, so take the minimum
        timestamps.iter().min().and_then(|oldest| oldest.checked_add_signed(self.window))
    }
}

/// Whole seconds, rounded up, never below one.
fn ceil_seconds(delta: TimeDelta) -> u64 {
    let millis = delta.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
