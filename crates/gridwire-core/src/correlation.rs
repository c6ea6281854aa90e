//! Sender-side bookkeeping for in-flight requests.
//!
//! The tracker owns every [`PendingRequest`] between send time and its one
//! terminal outcome. Map membership is the single source of truth: the
//! operation that removes an entry is the only one allowed to complete the
//! caller, so a late ACK or RESPONSE after a timeout, cancellation, or
//! earlier response finds nothing and is a silent no-op.
//!
//! # Thread Safety
//!
//! All state sits behind one `std::sync::Mutex`; no method awaits while
//! holding it, so timer tasks, the receive loop, and callers serialize
//! cleanly through the map.

use crate::retry::RetryPolicy;
use crate::{GridwireError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Completion continuation for one request.
pub type ResponseSender = oneshot::Sender<Result<Value>>;

/// Sender-side record for one in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub command: String,
    pub created_at: Instant,
    /// The encoded REQUEST frame, kept so retransmissions carry the same
    /// id and payload and correlation still lines up on both sides.
    pub frame: Vec<u8>,
    pub retries_sent: u32,
    pub acked: bool,
    ack_timer: Option<JoinHandle<()>>,
    response_timer: Option<JoinHandle<()>>,
    sender: Option<ResponseSender>,
}

impl PendingRequest {
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        frame: Vec<u8>,
        sender: ResponseSender,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            created_at: Instant::now(),
            frame,
            retries_sent: 0,
            acked: false,
            ack_timer: None,
            response_timer: None,
            sender: Some(sender),
        }
    }

    fn abort_timers(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.response_timer.take() {
            timer.abort();
        }
    }

    /// Deliver the terminal outcome to the caller and stop both timers.
    ///
    /// Consumes the record; a request that has been removed from the
    /// tracker can terminate exactly once.
    pub fn finish(mut self, outcome: Result<Value>) {
        self.abort_timers();
        debug!(
            "Request '{}' ({}) terminating after {:?}",
            self.command,
            self.id,
            self.created_at.elapsed()
        );
        if let Some(sender) = self.sender.take() {
            // The caller may have dropped its receiver; that is its way of
            // walking away from the result, not an error here.
            let _ = sender.send(outcome);
        }
    }

    /// Drop the record without notifying the caller. Used when the caller
    /// is being handed the error through another path.
    pub fn discard(mut self) {
        self.abort_timers();
    }
}

/// What the retry scheduler should do when an ACK deadline fires.
#[derive(Debug)]
pub enum AckTimeoutAction {
    /// Entry is gone or already acknowledged; the deadline is stale.
    Stale,
    /// Retransmit `frame` and re-arm the ACK deadline after `rearm_after`.
    Retry {
        frame: Vec<u8>,
        attempt: u32,
        rearm_after: std::time::Duration,
    },
    /// Retry budget exhausted; the removed entry must be failed.
    GiveUp(PendingRequest),
}

/// Owns the set of pending requests on the sending side.
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly sent request.
    ///
    /// Fails if the id already has a live entry. Ids are uuids generated
    /// at send time, so this only trips on a programming error.
    pub fn register(&self, entry: PendingRequest) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&entry.id) {
            return Err(GridwireError::DuplicateRequestId {
                id: entry.id.clone(),
            });
        }
        pending.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Attach the timer handles spawned for a just-registered request.
    pub fn set_timers(&self, id: &str, ack_timer: JoinHandle<()>, response_timer: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(id) {
            Some(entry) => {
                entry.ack_timer = Some(ack_timer);
                entry.response_timer = Some(response_timer);
            }
            // Terminated between register and here (immediate cancel);
            // the orphaned timers fire into a map miss and no-op.
            None => {
                ack_timer.abort();
                response_timer.abort();
            }
        }
    }

    /// Replace the ACK timer after a retransmission re-armed it.
    pub fn set_ack_timer(&self, id: &str, ack_timer: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(id) {
            Some(entry) => entry.ack_timer = Some(ack_timer),
            None => ack_timer.abort(),
        }
    }

    /// Peer confirmed receipt. Returns false for unknown or already-acked
    /// ids (stale or duplicate ACK).
    pub fn on_ack(&self, correlation_id: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(correlation_id) {
            Some(entry) if !entry.acked => {
                entry.acked = true;
                if let Some(timer) = entry.ack_timer.take() {
                    timer.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Peer answered. Removes and returns the entry so the caller can
    /// finish it; `None` means the request already terminated (duplicate
    /// or late response) and the answer must be ignored.
    pub fn on_response(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.pending.lock().unwrap().remove(correlation_id)
    }

    /// Remove an entry for timeout or cancellation. Same no-op contract
    /// as [`on_response`](Self::on_response).
    pub fn take(&self, id: &str) -> Option<PendingRequest> {
        self.pending.lock().unwrap().remove(id)
    }

    /// Decide what to do about an expired ACK deadline.
    ///
    /// Increments `retries_sent` when a retransmission is granted, so the
    /// attempt budget is charged before the frame goes back out.
    pub fn on_ack_timeout(&self, id: &str, policy: &RetryPolicy) -> AckTimeoutAction {
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(id) else {
            return AckTimeoutAction::Stale;
        };
        if entry.acked {
            return AckTimeoutAction::Stale;
        }

        match policy.next_attempt(entry.retries_sent) {
            Some(rearm_after) => {
                entry.retries_sent += 1;
                AckTimeoutAction::Retry {
                    frame: entry.frame.clone(),
                    attempt: entry.retries_sent,
                    rearm_after,
                }
            }
            None => match pending.remove(id) {
                Some(entry) => AckTimeoutAction::GiveUp(entry),
                None => AckTimeoutAction::Stale,
            },
        }
    }

    /// Remove every pending request, for failing them all at shutdown.
    pub fn drain(&self) -> Vec<PendingRequest> {
        let mut pending = self.pending.lock().unwrap();
        pending.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(id: &str) -> (PendingRequest, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest::new(id, "updateCell", b"frame".to_vec(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_register_duplicate_id_fails() {
        let tracker = CorrelationTracker::new();
        let (first, _rx1) = entry("req-1");
        let (second, _rx2) = entry("req-1");

        tracker.register(first).unwrap();
        let err = tracker.register(second).unwrap_err();
        assert!(matches!(err, GridwireError::DuplicateRequestId { .. }));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_response_resolves_exactly_once() {
        let tracker = CorrelationTracker::new();
        let (req, mut rx) = entry("req-1");
        tracker.register(req).unwrap();

        let taken = tracker.on_response("req-1").unwrap();
        taken.finish(Ok(Value::from(42)));

        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from(42));
        // Duplicate response finds nothing.
        assert!(tracker.on_response("req-1").is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_correlation_ids_are_noops() {
        let tracker = CorrelationTracker::new();
        assert!(!tracker.on_ack("ghost"));
        assert!(tracker.on_response("ghost").is_none());
        assert!(tracker.take("ghost").is_none());
    }

    #[tokio::test]
    async fn test_ack_marks_entry_and_duplicate_ack_is_noop() {
        let tracker = CorrelationTracker::new();
        let (req, _rx) = entry("req-1");
        tracker.register(req).unwrap();

        assert!(tracker.on_ack("req-1"));
        assert!(!tracker.on_ack("req-1"));
        // ACK alone does not terminate the request.
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_timeout_walks_retry_budget_then_gives_up() {
        let tracker = CorrelationTracker::new();
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(100));
        let (req, _rx) = entry("req-1");
        tracker.register(req).unwrap();

        for expected_attempt in 1..=2 {
            match tracker.on_ack_timeout("req-1", &policy) {
                AckTimeoutAction::Retry {
                    frame,
                    attempt,
                    rearm_after,
                } => {
                    assert_eq!(frame, b"frame".to_vec());
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(rearm_after, Duration::from_millis(100));
                }
                other => panic!("Expected Retry, got: {:?}", other),
            }
        }

        match tracker.on_ack_timeout("req-1", &policy) {
            AckTimeoutAction::GiveUp(entry) => {
                assert_eq!(entry.retries_sent, 2);
                entry.finish(Err(GridwireError::DeliveryFailed {
                    command: "updateCell".to_string(),
                    attempts: 2,
                }));
            }
            other => panic!("Expected GiveUp, got: {:?}", other),
        }
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_ack_timeout_after_ack_is_stale() {
        let tracker = CorrelationTracker::new();
        let policy = RetryPolicy::default();
        let (req, _rx) = entry("req-1");
        tracker.register(req).unwrap();

        tracker.on_ack("req-1");
        assert!(matches!(
            tracker.on_ack_timeout("req-1", &policy),
            AckTimeoutAction::Stale
        ));
    }

    #[tokio::test]
    async fn test_ack_timeout_after_termination_is_stale() {
        let tracker = CorrelationTracker::new();
        let policy = RetryPolicy::default();
        let (req, _rx) = entry("req-1");
        tracker.register(req).unwrap();

        tracker.take("req-1").unwrap().discard();
        assert!(matches!(
            tracker.on_ack_timeout("req-1", &policy),
            AckTimeoutAction::Stale
        ));
    }

    #[tokio::test]
    async fn test_finish_rejects_with_timeout() {
        let tracker = CorrelationTracker::new();
        let (req, mut rx) = entry("req-1");
        tracker.register(req).unwrap();

        let taken = tracker.take("req-1").unwrap();
        taken.finish(Err(GridwireError::RequestTimeout {
            command: "updateCell".to_string(),
            timeout: Duration::from_secs(10),
        }));

        let outcome = rx.try_recv().unwrap();
        assert!(matches!(
            outcome,
            Err(GridwireError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_removes_everything() {
        let tracker = CorrelationTracker::new();
        let (a, _rx_a) = entry("req-a");
        let (b, _rx_b) = entry("req-b");
        tracker.register(a).unwrap();
        tracker.register(b).unwrap();

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        assert!(tracker.is_empty());
        for entry in drained {
            entry.finish(Err(GridwireError::ChannelClosed));
        }
    }

    #[tokio::test]
    async fn test_set_timers_on_terminated_entry_aborts_them() {
        let tracker = CorrelationTracker::new();
        let (req, _rx) = entry("req-1");
        tracker.register(req).unwrap();
        tracker.take("req-1").unwrap().discard();

        let ack = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await });
        let resp = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await });
        tracker.set_timers("req-1", ack, resp);
        // Nothing to assert beyond not leaking live timers; the handles
        // were aborted synchronously above.
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_finish_with_dropped_receiver_does_not_panic() {
        let tracker = CorrelationTracker::new();
        let (req, rx) = entry("req-1");
        tracker.register(req).unwrap();
        drop(rx);

        tracker
            .take("req-1")
            .unwrap()
            .finish(Ok(Value::Null));
    }
}
