//! Retransmission policy for the ACK phase.
//!
//! Retries apply only until the peer acknowledges receipt; once an ACK
//! arrives, slow processing is the response timeout's problem, not
//! retry's. Backoff is flat with no jitter or exponential growth: the
//! channel is process-local and low-latency.

use crate::config::EndpointConfig;
use std::time::Duration;

/// Fixed-backoff retransmission policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retransmissions (not counting the initial send).
    pub max_retries: u32,
    /// Spacing between retransmissions.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retransmissions.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the spacing between retransmissions.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Take the retry knobs from an endpoint config.
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    /// Decide whether another retransmission is allowed after
    /// `retries_sent` have already gone out.
    ///
    /// Returns the delay until the next ACK deadline, or `None` when the
    /// budget is exhausted and the request must fail with delivery-failed.
    pub fn next_attempt(&self, retries_sent: u32) -> Option<Duration> {
        (retries_sent < self.max_retries).then_some(self.retry_delay)
    }
}
