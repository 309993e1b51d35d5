//! Reconnect policy for the change feed.

use momentum_core::FeedSettings;
use std::time::Duration;

/// Exponential reconnect delay plus a consecutive-failure counter that
/// decides when to give up on streaming and poll instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
    polling_threshold: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, polling_threshold: u32) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
            polling_threshold,
        }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.failures_before_polling,
        )
    }

    /// Count a failed connection attempt.
    ///
    /// Returns the delay to wait before the next attempt; the following
    /// delay is doubled, clamped to the maximum.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// A connection (or a poll) succeeded.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn should_poll(&self) -> bool {
        self.failures >= self.polling_threshold
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&FeedSettings::default())
    }
}
