//! Retry pacing for the bootstrap loop.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::error::FailureCategory;
use crate::constants::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};

/// Backoff range for retries.
///
/// The first retry waits `min_backoff`; each further retry doubles the wait (plus a
/// little jitter) up to `max_backoff`. If `min_backoff > max_backoff` the two are
/// swapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Initial delay before retrying.
    pub min_backoff: Duration,
    /// Maximum delay between retries.
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

/// Tracks consecutive failures of the same category so repeated ones can be logged
/// at DEBUG instead of WARN.
///
/// The first `max_consecutive` occurrences in a row are loud; a different category
/// or a [`reset`](Self::reset) starts over.
pub(crate) struct ErrorTracker {
    last_category: Option<FailureCategory>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_category: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records a failure; returns `true` if it should be logged at WARN.
    pub(crate) fn record_error(&mut self, category: FailureCategory) -> bool {
        let should_warn = self.last_category != Some(category)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_category == Some(category) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_category = Some(category);
        }

        should_warn
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Sleeps for `dur`; returns `true` if `token` was cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Exponential backoff with small jitter.
///
/// Doubles `current`, clamps to `max`, adds up to 10% jitter and clamps again, so the
/// sequence never decreases and never exceeds `max`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = (cur.saturating_mul(2)).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis((base.saturating_add(add)).min(max))
}

/// Wait before the next attempt: the current backoff, stretched to honour a server's
/// `Retry-After`, never above `max`.
pub(crate) fn retry_delay(
    backoff: Duration,
    retry_after: Option<Duration>,
    max: Duration,
) -> Duration {
    retry_after.map_or(backoff, |ra| backoff.max(ra)).min(max)
}
