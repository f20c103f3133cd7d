//! Reconnect retry policy: explicit, timer-free, testable.
//!
//! The connection loop owns the clock; the policy only computes delays.

use std::time::Duration;

/// Exponential backoff policy for reconnect attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Give up after this many consecutive failures; 0 means retry forever.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based), or None when the
    /// policy is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts != 0 && attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.min(31);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        Some(delay.min(self.max_delay))
    }
}

/// Mutable attempt counter driven by the connection state machine.
/// A successful connection resets it.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt and return the delay before the next one,
    /// or None when the policy is exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        let delay = policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connection.
    pub fn record_success(&mut self) {
        self.attempt = 0;
    }
}
