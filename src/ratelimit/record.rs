//! Fixed-window rate limit record.

use std::time::Duration;

/// Whole milliseconds in `duration`, saturating for absurd durations.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Whole seconds from `now` until `reset_at`, rounded up and never negative.
pub(crate) fn seconds_until(reset_at: u64, now: u64) -> u64 {
    reset_at.saturating_sub(now).div_ceil(1000)
}

/// Per (policy, key) counting state for the current window.
///
/// All timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// Caller identity this record counts against
    pub key: String,
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window began
    pub window_start: u64,
    /// When the current window ends; always `window_start + window`
    pub reset_at: u64,
    /// Set once `count` has exceeded the threshold in this window
    pub blocked: bool,
}

impl RateLimitRecord {
    /// Create a fresh record whose window starts at `now`.
    pub fn new(key: &str, now: u64, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            count: 0,
            window_start: now,
            reset_at: now.saturating_add(duration_millis(window)),
            blocked: false,
        }
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.reset_at
    }

    /// Start a new window at `now`.
    pub fn reset(&mut self, now: u64, window: Duration) {
        self.count = 0;
        self.blocked = false;
        self.window_start = now;
        self.reset_at = now.saturating_add(duration_millis(window));
    }

    /// Reset the window if it has ended. Returns `true` if it rolled over.
    pub fn roll_if_expired(&mut self, now: u64, window: Duration) -> bool {
        if self.is_expired(now) {
            self.reset(now, window);
            true
        } else {
            false
        }
    }

    /// Count one more request and return the new count.
    pub fn increment(&mut self) -> u64 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Undo one counted request, never going below zero.
    pub fn decrement(&mut self) -> u64 {
        self.count = self.count.saturating_sub(1);
        self.count
    }

    /// Seconds until the window resets.
    pub fn retry_after_secs(&self, now: u64) -> u64 {
        seconds_until(self.reset_at, now)
    }
}
