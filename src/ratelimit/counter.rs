//! In-process window counter.

use std::time::Duration;

/// A count of admissions plus the start of the window they belong to.
///
/// Counters are replaced, never decremented: once the window has elapsed the
/// next attempt starts a fresh counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Admissions in the current window
    count: u64,
    /// When the current window started (epoch millis)
    window_start: u64,
}

impl WindowCounter {
    /// A counter for a window starting at `now` with one admission recorded.
    pub fn first(now: u64) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Whether the window starting at `window_start` has elapsed.
    pub fn is_expired(&self, now: u64, window_millis: u64) -> bool {
        now.saturating_sub(self.window_start) >= window_millis
    }

    /// Try to admit one attempt.
    ///
    /// Returns `true` if the attempt is within `limit`.
    pub fn try_admit(&mut self, now: u64, limit: u64, window_millis: u64) -> bool {
        if self.is_expired(now, window_millis) {
            *self = Self::first(now);
            return true;
        }
        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Admissions counted in the current window, zero once it has elapsed.
    pub fn current_count(&self, now: u64, window_millis: u64) -> u64 {
        if self.is_expired(now, window_millis) {
            0
        } else {
            self.count
        }
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self, now: u64, window_millis: u64) -> Duration {
        let end = self.window_start.saturating_add(window_millis);
        Duration::from_millis(end.saturating_sub(now))
    }
}
