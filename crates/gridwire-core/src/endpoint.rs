//! The per-process communication endpoint.
//!
//! One `Endpoint` lives on each side of the channel (host controller and
//! embedded UI). It composes the codec, correlation tracker, retry
//! policy, heartbeat monitor, and handler registry behind the public
//! `send_request` / `send_notification` / `register_handler` contract the
//! rest of the editor consumes.
//!
//! # Thread Safety
//!
//! The endpoint runs on the tokio runtime. A spawned receive loop drains
//! the inbox, a heartbeat loop exchanges PING/PONG, and a resync loop
//! issues periodic state-resynchronization requests. All shared state
//! lives behind the tracker's and monitor's own locks; timer tasks that
//! fire after their request terminated hit a map miss and no-op.

use crate::config::EndpointConfig;
use crate::correlation::{AckTimeoutAction, CorrelationTracker, PendingRequest};
use crate::dispatch::{self, CommandHandler, HandlerRegistry};
use crate::heartbeat::{HealthSnapshot, HealthState, HeartbeatMonitor};
use crate::protocol::{self, commands, Message, MessageKind, ReplyPayload};
use crate::retry::RetryPolicy;
use crate::transport::{Inbox, Transport};
use crate::{GridwireError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A request in flight. Exposes the generated id so the caller can cancel
/// before completion.
#[derive(Debug)]
pub struct PendingCall {
    pub id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Wait for the terminal outcome of this request.
    pub async fn wait(self) -> Result<Value> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(GridwireError::ChannelClosed))
    }
}

struct EndpointInner {
    config: EndpointConfig,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    tracker: CorrelationTracker,
    registry: HandlerRegistry,
    health: HeartbeatMonitor,
    shutdown_tx: watch::Sender<bool>,
}

/// One side of the channel. Dropping shuts the endpoint down.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut: AtomicBool,
}

impl Endpoint {
    /// Start an endpoint over the given transport halves.
    ///
    /// Spawns the receive, heartbeat, and resync loops on the current
    /// tokio runtime.
    pub fn start<T: Transport>(config: EndpointConfig, transport: T, inbox: Inbox) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let health = HeartbeatMonitor::new(config.name.clone(), config.missed_pong_threshold);
        let retry = RetryPolicy::from_config(&config);

        let inner = Arc::new(EndpointInner {
            config,
            retry,
            transport: Arc::new(transport),
            tracker: CorrelationTracker::new(),
            registry: HandlerRegistry::new(),
            health,
            shutdown_tx,
        });

        info!("{}: endpoint started", inner.config.name);

        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).receive_loop(inbox, inner.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&inner).heartbeat_loop(inner.shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(&inner).sync_loop(inner.shutdown_tx.subscribe())),
        ];

        Self {
            inner,
            tasks: Mutex::new(tasks),
            shut: AtomicBool::new(false),
        }
    }

    /// Send a REQUEST and wait for its terminal outcome: the peer's
    /// response value, or `DeliveryFailed` / `RequestTimeout` /
    /// `CommandNotSupported` / `HandlerFailure`.
    pub async fn send_request(&self, command: &str, payload: Value) -> Result<Value> {
        self.begin_request(command, payload)?.wait().await
    }

    /// Send a REQUEST and return the in-flight handle without waiting.
    /// Use this when the caller may need to [`cancel`](Self::cancel).
    pub fn begin_request(&self, command: &str, payload: Value) -> Result<PendingCall> {
        self.inner.begin_request(command, payload)
    }

    /// Fire-and-forget NOTIFICATION. No ACK, no retry, no response.
    pub fn send_notification(&self, command: &str, payload: Value) -> Result<()> {
        let message = Message::notification(command, payload);
        self.inner.send_message(&message)
    }

    /// Register a handler for `command`. Last registration wins.
    pub fn register_handler(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.inner.registry.register(command, handler);
    }

    /// Register an async closure as the handler for `command`.
    pub fn register_handler_fn<F, Fut>(&self, command: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.inner.registry.register_fn(command, f);
    }

    /// Register a callback for healthy/degraded transitions.
    pub fn on_health_change(&self, observer: impl Fn(HealthState) + Send + Sync + 'static) {
        self.inner.health.on_health_change(Box::new(observer));
    }

    /// Current connection health.
    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// Cancel an in-flight request. Its caller sees `Cancelled`; a late
    /// ACK or RESPONSE for the id is silently ignored afterwards.
    ///
    /// Returns false if the request already terminated.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.inner.tracker.take(request_id) {
            Some(entry) => {
                debug!(
                    "{}: cancelled request '{}' ({})",
                    self.inner.config.name, entry.command, request_id
                );
                entry.finish(Err(GridwireError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Number of requests currently awaiting a terminal outcome.
    pub fn pending_requests(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop all loops and fail every in-flight request with
    /// `ChannelClosed`. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for entry in self.inner.tracker.drain() {
            entry.finish(Err(GridwireError::ChannelClosed));
        }
        info!("{}: endpoint shut down", self.inner.config.name);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("pending_requests", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl EndpointInner {
    fn send_message(&self, message: &Message) -> Result<()> {
        let frame = protocol::encode(message)?;
        self.transport.send(frame)
    }

    fn begin_request(self: &Arc<Self>, command: &str, payload: Value) -> Result<PendingCall> {
        let message = Message::request(command, payload);
        let frame = protocol::encode(&message)?;
        let id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        self.tracker
            .register(PendingRequest::new(id.clone(), command, frame.clone(), tx))?;

        let ack_timer = {
            let inner = Arc::clone(self);
            let id = id.clone();
            let ack_timeout = self.config.ack_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(ack_timeout).await;
                inner.handle_ack_timeout(&id);
            })
        };
        let response_timer = {
            let inner = Arc::clone(self);
            let id = id.clone();
            let response_timeout = self.config.response_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(response_timeout).await;
                inner.handle_response_timeout(&id);
            })
        };
        self.tracker.set_timers(&id, ack_timer, response_timer);

        if let Err(e) = self.transport.send(frame) {
            // A refused send means the channel itself is gone; fail fast
            // instead of burning the retry schedule.
            if let Some(entry) = self.tracker.take(&id) {
                entry.discard();
            }
            return Err(e);
        }

        debug!("{}: sent request '{}' ({})", self.config.name, command, id);
        Ok(PendingCall { id, rx })
    }

    /// The ACK deadline for `id` fired: retransmit or give up, per the
    /// retry policy. Stale deadlines (request already acked or
    /// terminated) are no-ops.
    fn handle_ack_timeout(self: &Arc<Self>, id: &str) {
        match self.tracker.on_ack_timeout(id, &self.retry) {
            AckTimeoutAction::Stale => {}
            AckTimeoutAction::Retry {
                frame,
                attempt,
                rearm_after,
            } => {
                warn!(
                    "{}: no ACK for {}, retransmitting (attempt {}/{})",
                    self.config.name, id, attempt, self.retry.max_retries
                );
                if let Err(e) = self.transport.send(frame) {
                    warn!("{}: retransmission failed for {}: {}", self.config.name, id, e);
                    if let Some(entry) = self.tracker.take(id) {
                        entry.finish(Err(GridwireError::ChannelClosed));
                    }
                    return;
                }
                let timer = {
                    let inner = Arc::clone(self);
                    let id = id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(rearm_after).await;
                        inner.handle_ack_timeout(&id);
                    })
                };
                self.tracker.set_ack_timer(id, timer);
            }
            AckTimeoutAction::GiveUp(entry) => {
                warn!(
                    "{}: delivery failed for '{}' ({}): no ACK after {} retransmissions",
                    self.config.name, entry.command, id, entry.retries_sent
                );
                let command = entry.command.clone();
                let attempts = entry.retries_sent;
                entry.finish(Err(GridwireError::DeliveryFailed { command, attempts }));
            }
        }
    }

    /// The response deadline for `id` fired. This applies even when the
    /// ACK arrived: ACK only proves the message landed, not that the work
    /// completed.
    fn handle_response_timeout(&self, id: &str) {
        if let Some(entry) = self.tracker.take(id) {
            warn!(
                "{}: request '{}' ({}) timed out awaiting response",
                self.config.name, entry.command, id
            );
            let command = entry.command.clone();
            let timeout = self.config.response_timeout;
            entry.finish(Err(GridwireError::RequestTimeout { command, timeout }));
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut inbox: Inbox,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.changed() => break,
                frame = inbox.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        info!("{}: channel closed by peer", self.config.name);
                        for entry in self.tracker.drain() {
                            entry.finish(Err(GridwireError::ChannelClosed));
                        }
                        break;
                    }
                },
            };
            self.handle_frame(frame);
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let message = match protocol::decode(&frame) {
            Ok(message) => message,
            // Transport-level garbage is recovered locally: log and drop,
            // never propagate to a caller.
            Err(e) => {
                warn!("{}: dropping frame: {}", self.config.name, e);
                return;
            }
        };

        debug!(
            "{}: received {} ({})",
            self.config.name, message.kind, message.id
        );

        match message.kind {
            MessageKind::Request => self.handle_request(message),
            MessageKind::Response => self.handle_response(message),
            MessageKind::Ack => {
                let correlation_id = message.correlation_id.unwrap_or_default();
                if !self.tracker.on_ack(&correlation_id) {
                    debug!(
                        "{}: ignoring stale ACK for {}",
                        self.config.name, correlation_id
                    );
                }
            }
            MessageKind::Notification => {
                let command = message.command.unwrap_or_default();
                let payload = message.payload.unwrap_or(Value::Null);
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    dispatch::deliver_notification(&inner.registry, &command, payload).await;
                });
            }
            MessageKind::Ping => {
                let pong = Message::pong(message.payload);
                if let Err(e) = self.send_message(&pong) {
                    debug!("{}: failed to answer PING: {}", self.config.name, e);
                }
            }
            MessageKind::Pong => {
                self.health
                    .record_pong(message.payload.as_ref().and_then(Value::as_i64));
            }
        }
    }

    fn handle_request(self: &Arc<Self>, message: Message) {
        // ACK before invoking the handler, so the peer's ack timer clears
        // even if the handler is slow or fails.
        let ack = Message::ack(message.id.clone());
        if let Err(e) = self.send_message(&ack) {
            warn!(
                "{}: failed to ACK request {}: {}",
                self.config.name, message.id, e
            );
        }

        let command = message.command.unwrap_or_default();
        let payload = message.payload.unwrap_or(Value::Null);
        let request_id = message.id;
        let inner = Arc::clone(self);
        // Handlers run on their own task; a slow handler must not stall
        // ACKs and heartbeats for unrelated traffic.
        tokio::spawn(async move {
            let reply = dispatch::answer_request(&inner.registry, &command, payload).await;
            match Message::response(request_id.clone(), reply) {
                Ok(response) => {
                    if let Err(e) = inner.send_message(&response) {
                        warn!(
                            "{}: failed to send response for {}: {}",
                            inner.config.name, request_id, e
                        );
                    }
                }
                Err(e) => warn!(
                    "{}: failed to frame response for {}: {}",
                    inner.config.name, request_id, e
                ),
            }
        });
    }

    fn handle_response(&self, message: Message) {
        let correlation_id = message.correlation_id.unwrap_or_default();
        // Parse before touching the tracker: a RESPONSE with an
        // unreadable payload is a malformed frame and must not consume
        // the pending entry.
        let reply: ReplyPayload =
            match serde_json::from_value(message.payload.unwrap_or(Value::Null)) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        "{}: dropping response with malformed payload for {}: {}",
                        self.config.name, correlation_id, e
                    );
                    return;
                }
            };

        let Some(entry) = self.tracker.on_response(&correlation_id) else {
            debug!(
                "{}: ignoring late or duplicate response for {}",
                self.config.name, correlation_id
            );
            return;
        };

        let outcome = reply.into_outcome(&entry.command);
        entry.finish(outcome);
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            let ping = Message::ping();
            // Count the previous miss before this PING goes out, so an
            // unreachable peer still degrades health.
            self.health.on_ping_sent(ping.timestamp);
            if let Err(e) = self.send_message(&ping) {
                debug!("{}: failed to send heartbeat: {}", self.config.name, e);
            }
        }
    }

    /// Periodic full state-resynchronization, repairing drift from missed
    /// notifications. A plain request through the ordinary path: it obeys
    /// the same ACK/retry/timeout rules as consumer traffic.
    async fn sync_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
            debug!("{}: requesting state resync", self.config.name);
            match self.begin_request(commands::SYNC_STATE, Value::Null) {
                Ok(call) => {
                    let name = self.config.name.clone();
                    tokio::spawn(async move {
                        match call.wait().await {
                            Ok(_) => debug!("{}: state resync complete", name),
                            Err(GridwireError::CommandNotSupported { .. }) => {
                                debug!("{}: peer does not serve state resync", name);
                            }
                            Err(e) => warn!("{}: state resync failed: {}", name, e),
                        }
                    });
                }
                Err(e) => debug!(
                    "{}: could not send resync request: {}",
                    self.config.name, e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use serde_json::json;

    fn pair(config: impl Fn() -> EndpointConfig) -> (Endpoint, Endpoint) {
        let (host_end, ui_end) = memory::duplex();
        let host = Endpoint::start(
            config().with_name("host"),
            host_end.transport,
            host_end.inbox,
        );
        let ui = Endpoint::start(config().with_name("ui"), ui_end.transport, ui_end.inbox);
        (host, ui)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (host, ui) = pair(EndpointConfig::new);
        ui.register_handler_fn("updateCell", |payload| async move {
            assert_eq!(payload, json!({"row": 2, "col": 1, "value": "hi"}));
            Ok(json!({"success": true}))
        });

        let result = host
            .send_request("updateCell", json!({"row": 2, "col": 1, "value": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"success": true}));
        assert_eq!(host.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_notification_reaches_peer_handler() {
        let (host, ui) = pair(EndpointConfig::new);
        let (tx, rx) = oneshot::channel::<Value>();
        let tx = Mutex::new(Some(tx));
        ui.register_handler_fn("selectionChanged", move |payload| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(payload);
                }
                Ok(Value::Null)
            }
        });

        host.send_notification("selectionChanged", json!({"row": 4}))
            .unwrap();
        assert_eq!(rx.await.unwrap(), json!({"row": 4}));
    }

    #[tokio::test]
    async fn test_missing_handler_rejects_with_command_not_supported() {
        let (host, _ui) = pair(EndpointConfig::new);

        let err = host.send_request("sortRows", json!({})).await.unwrap_err();
        match err {
            GridwireError::CommandNotSupported { command } => assert_eq!(command, "sortRows"),
            other => panic!("Expected CommandNotSupported, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_handler_rejects_with_handler_failure() {
        let (host, ui) = pair(EndpointConfig::new);
        ui.register_handler_fn("updateCell", |_| async {
            Err(GridwireError::HandlerFailure {
                command: "updateCell".to_string(),
                message: "row out of range".to_string(),
            })
        });

        let err = host.send_request("updateCell", json!({})).await.unwrap_err();
        assert!(matches!(err, GridwireError::HandlerFailure { .. }));
    }

    #[tokio::test]
    async fn test_cancel_rejects_caller_and_forgets_request() {
        let (host, ui) = pair(EndpointConfig::new);
        ui.register_handler_fn("export", |_| async {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        });

        let call = host.begin_request("export", json!({})).unwrap();
        let id = call.id.clone();
        assert!(host.cancel(&id));
        assert!(matches!(call.wait().await, Err(GridwireError::Cancelled)));

        // Second cancel finds nothing.
        assert!(!host.cancel(&id));
        assert_eq!(host.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_inflight_requests() {
        let (host, ui) = pair(EndpointConfig::new);
        ui.register_handler_fn("export", |_| async {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        });

        let call = host.begin_request("export", json!({})).unwrap();
        host.shutdown();
        assert!(matches!(
            call.wait().await,
            Err(GridwireError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_on_torn_down_channel_fails_fast() {
        let (host_end, ui_end) = memory::duplex();
        let host = Endpoint::start(
            EndpointConfig::new().with_name("host"),
            host_end.transport,
            host_end.inbox,
        );
        drop(ui_end);

        let err = host.begin_request("updateCell", json!({})).unwrap_err();
        assert!(matches!(err, GridwireError::ChannelClosed));
        assert_eq!(host.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_response_does_not_resolve_twice() {
        // Drive the host against a hand-rolled peer so we control exactly
        // what comes back.
        let (host_end, mut peer_end) = memory::duplex();
        let host = Endpoint::start(
            EndpointConfig::new().with_name("host"),
            host_end.transport,
            host_end.inbox,
        );

        let call = host.begin_request("getTable", json!({})).unwrap();
        let frame = peer_end.inbox.recv().await.unwrap();
        let request = protocol::decode(&frame).unwrap();

        let response =
            Message::response(request.id.clone(), ReplyPayload::ok(json!("table"))).unwrap();
        let frame = protocol::encode(&response).unwrap();
        peer_end.transport.send(frame.clone()).unwrap();
        peer_end.transport.send(frame).unwrap();

        assert_eq!(call.wait().await.unwrap(), json!("table"));
        tokio::task::yield_now().await;
        assert_eq!(host.pending_requests(), 0);
    }
}
