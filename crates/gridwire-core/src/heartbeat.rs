//! Connection health tracking driven by the PING/PONG heartbeat.
//!
//! The monitor holds the per-endpoint [`ConnectionHealth`] state and
//! decides transitions:
//! - Healthy -> Degraded when the missed-PONG counter crosses the
//!   threshold, exactly once per crossing;
//! - Degraded -> Healthy on the first subsequent PONG, exactly once.
//!
//! The endpoint's heartbeat loop calls [`on_ping_sent`](HeartbeatMonitor::on_ping_sent)
//! each cadence tick and [`record_pong`](HeartbeatMonitor::record_pong)
//! when the peer answers; the monitor never touches the channel itself.

use crate::protocol;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Liveness state of the peer as this endpoint sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Degraded => write!(f, "DEGRADED"),
        }
    }
}

/// Callback invoked on every health transition.
pub type HealthObserver = Box<dyn Fn(HealthState) + Send + Sync>;

/// Point-in-time view of connection health, for consumers that gate UI
/// actions on liveness.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_missed_pongs: u32,
    pub last_pong_at: Option<Instant>,
    pub last_rtt: Option<Duration>,
}

#[derive(Debug)]
struct ConnectionHealth {
    state: HealthState,
    consecutive_missed_pongs: u32,
    last_pong_at: Option<Instant>,
    last_rtt: Option<Duration>,
    /// Timestamp of the outstanding PING, if its PONG has not arrived yet.
    awaiting_pong_for: Option<i64>,
}

/// Tracks peer liveness for one endpoint.
pub struct HeartbeatMonitor {
    name: String,
    threshold: u32,
    health: Mutex<ConnectionHealth>,
    observers: Mutex<Vec<HealthObserver>>,
}

impl HeartbeatMonitor {
    pub fn new(name: impl Into<String>, threshold: u32) -> Self {
        Self {
            name: name.into(),
            threshold,
            health: Mutex::new(ConnectionHealth {
                state: HealthState::Healthy,
                consecutive_missed_pongs: 0,
                last_pong_at: None,
                last_rtt: None,
                awaiting_pong_for: None,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for healthy/degraded transitions.
    pub fn on_health_change(&self, observer: HealthObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Current health, cheap enough to poll from UI code.
    pub fn snapshot(&self) -> HealthSnapshot {
        let health = self.health.lock().unwrap();
        HealthSnapshot {
            state: health.state,
            consecutive_missed_pongs: health.consecutive_missed_pongs,
            last_pong_at: health.last_pong_at,
            last_rtt: health.last_rtt,
        }
    }

    pub fn state(&self) -> HealthState {
        self.health.lock().unwrap().state
    }

    /// A PING just went out with `sent_at_ms` as its payload.
    ///
    /// If the previous PING is still unanswered this counts a miss first,
    /// which may degrade health.
    pub fn on_ping_sent(&self, sent_at_ms: i64) {
        let transition = {
            let mut health = self.health.lock().unwrap();
            let mut transition = None;

            if let Some(unanswered) = health.awaiting_pong_for.take() {
                health.consecutive_missed_pongs += 1;
                debug!(
                    "{}: no PONG for PING sent at {} ({} consecutive)",
                    self.name, unanswered, health.consecutive_missed_pongs
                );
                if health.consecutive_missed_pongs >= self.threshold
                    && health.state == HealthState::Healthy
                {
                    health.state = HealthState::Degraded;
                    transition = Some(HealthState::Degraded);
                }
            }

            health.awaiting_pong_for = Some(sent_at_ms);
            transition
        };

        if let Some(state) = transition {
            warn!(
                "{}: connection degraded after {} missed heartbeats",
                self.name, self.threshold
            );
            self.notify(state);
        }
    }

    /// The peer answered with a PONG echoing `echoed_ms`.
    pub fn record_pong(&self, echoed_ms: Option<i64>) {
        let transition = {
            let mut health = self.health.lock().unwrap();
            health.awaiting_pong_for = None;
            health.consecutive_missed_pongs = 0;
            health.last_pong_at = Some(Instant::now());
            if let Some(sent_at) = echoed_ms {
                let rtt_ms = (protocol::now_ms() - sent_at).max(0) as u64;
                health.last_rtt = Some(Duration::from_millis(rtt_ms));
                debug!("{}: heartbeat round trip {}ms", self.name, rtt_ms);
            }

            if health.state == HealthState::Degraded {
                health.state = HealthState::Healthy;
                Some(HealthState::Healthy)
            } else {
                None
            }
        };

        if let Some(state) = transition {
            info!("{}: connection recovered", self.name);
            self.notify(state);
        }
    }

    fn notify(&self, state: HealthState) {
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer(state);
        }
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}
