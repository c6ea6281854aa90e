//! Endpoint configuration and protocol constants.
//!
//! Every endpoint receives its own `EndpointConfig` at construction time;
//! there is no process-global configuration, so independent channels (for
//! example under test) can run with different tunables side by side.

use std::time::Duration;

/// Per-endpoint tunables for timeouts, retry, and heartbeat cadence.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name used as log context (e.g. "host" or "ui").
    pub name: String,
    /// How long to wait for an ACK before the first retransmission.
    pub ack_timeout: Duration,
    /// How long to wait for a RESPONSE before failing the request.
    /// Counted from send time, independent of the ACK phase.
    pub response_timeout: Duration,
    /// Maximum number of retransmissions when no ACK arrives.
    pub max_retries: u32,
    /// Spacing between retransmissions. Flat, no jitter: the channel is
    /// process-local and low-latency.
    pub retry_delay: Duration,
    /// PING cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive missed PONGs before health degrades.
    pub missed_pong_threshold: u32,
    /// Cadence of the full state-resynchronization request.
    pub sync_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "endpoint".to_string(),
            ack_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            missed_pong_threshold: 3,
            sync_interval: Duration::from_secs(60),
        }
    }
}

impl EndpointConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log-context name for this endpoint.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the ACK timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the RESPONSE timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
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

    /// Set the PING cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the missed-PONG threshold.
    pub fn with_missed_pong_threshold(mut self, threshold: u32) -> Self {
        self.missed_pong_threshold = threshold;
        self
    }

    /// Set the state-resynchronization cadence.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// Protocol-level limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum accepted frame size. Frames above this are rejected at
    /// decode time before JSON parsing is attempted.
    pub const MAX_FRAME_SIZE: usize = 1_048_576; // 1MB
}
