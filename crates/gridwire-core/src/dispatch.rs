//! Command handler registry and request answering.
//!
//! Consumers register one handler per command; registering again for the
//! same command replaces the previous entry, since only one handler per
//! command per endpoint is meaningful. The dispatcher guarantees every
//! accepted REQUEST produces a RESPONSE: a missing handler answers
//! `CommandNotSupported` and a failing handler answers with its failure,
//! never silence.

use crate::protocol::{ReplyErrorKind, ReplyPayload};
use crate::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A registered command handler.
///
/// Handlers answer REQUESTs (the returned value rides back in the
/// RESPONSE) and observe NOTIFICATIONs (the return value is ignored).
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value>;
}

/// Adapter so plain async closures can be registered as handlers.
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    async fn handle(&self, payload: Value) -> Result<Value> {
        (self.0)(payload).await
    }
}

/// Maps command names to handlers. Last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `command`, replacing any previous one.
    pub fn register(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let command = command.into();
        let mut handlers = self.handlers.write().unwrap();
        if handlers.insert(command.clone(), handler).is_some() {
            debug!("Replacing handler for '{}'", command);
        }
    }

    /// Register an async closure for `command`.
    pub fn register_fn<F, Fut>(&self, command: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let wrapped = move |payload: Value| -> BoxFuture<'static, Result<Value>> {
            Box::pin(f(payload))
        };
        self.register(command, Arc::new(FnHandler(wrapped)));
    }

    /// Look up the handler for `command`.
    pub fn lookup(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.read().unwrap().get(command).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap();
        f.debug_struct("HandlerRegistry")
            .field("commands", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run the handler for an incoming REQUEST and produce the reply that
/// must go back, whatever happened.
pub(crate) async fn answer_request(
    registry: &HandlerRegistry,
    command: &str,
    payload: Value,
) -> ReplyPayload {
    let Some(handler) = registry.lookup(command) else {
        debug!("No handler registered for request '{}'", command);
        return ReplyPayload::fail(
            ReplyErrorKind::CommandNotSupported,
            format!("no handler registered for '{}'", command),
        );
    };

    match handler.handle(payload).await {
        Ok(value) => ReplyPayload::ok(value),
        Err(e) => {
            warn!("Handler for '{}' failed: {}", command, e);
            ReplyPayload::fail(ReplyErrorKind::HandlerFailure, e.to_string())
        }
    }
}

/// Run the handler for an incoming NOTIFICATION. No response is expected;
/// a missing handler is logged, not an error.
pub(crate) async fn deliver_notification(
    registry: &HandlerRegistry,
    command: &str,
    payload: Value,
) {
    let Some(handler) = registry.lookup(command) else {
        debug!("Dropping notification '{}': no handler registered", command);
        return;
    };

    if let Err(e) = handler.handle(payload).await {
        warn!("Notification handler for '{}' failed: {}", command, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GridwireError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_registered_handler_answers() {
        let registry = HandlerRegistry::new();
        registry.register_fn("updateCell", |payload| async move {
            assert_eq!(payload["row"], 2);
            Ok(json!({"applied": true}))
        });

        let reply = answer_request(&registry, "updateCell", json!({"row": 2})).await;
        assert!(reply.success);
        assert_eq!(reply.value, Some(json!({"applied": true})));
    }

    #[tokio::test]
    async fn test_missing_handler_answers_not_supported() {
        let registry = HandlerRegistry::new();
        let reply = answer_request(&registry, "sortRows", json!({})).await;

        assert!(!reply.success);
        assert_eq!(
            reply.error.unwrap().kind,
            ReplyErrorKind::CommandNotSupported
        );
    }

    #[tokio::test]
    async fn test_failing_handler_answers_with_failure() {
        let registry = HandlerRegistry::new();
        registry.register_fn("updateCell", |_| async {
            Err(GridwireError::HandlerFailure {
                command: "updateCell".to_string(),
                message: "row out of range".to_string(),
            })
        });

        let reply = answer_request(&registry, "updateCell", json!({})).await;
        assert!(!reply.success);
        let err = reply.error.unwrap();
        assert_eq!(err.kind, ReplyErrorKind::HandlerFailure);
        assert!(err.message.contains("row out of range"));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register_fn("getTable", |_| async { Ok(json!("first")) });
        registry.register_fn("getTable", |_| async { Ok(json!("second")) });

        let reply = answer_request(&registry, "getTable", json!({})).await;
        assert_eq!(reply.value, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_notification_invokes_handler() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        registry.register_fn("selectionChanged", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        deliver_notification(&registry, "selectionChanged", json!({"row": 1})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notification_without_handler_is_silent() {
        let registry = HandlerRegistry::new();
        // Must not panic or produce a reply.
        deliver_notification(&registry, "themeChanged", json!({})).await;
    }

    #[tokio::test]
    async fn test_trait_object_handlers_register_too() {
        struct Echo;

        #[async_trait::async_trait]
        impl CommandHandler for Echo {
            async fn handle(&self, payload: Value) -> Result<Value> {
                Ok(payload)
            }
        }

        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let reply = answer_request(&registry, "echo", json!({"a": 1})).await;
        assert_eq!(reply.value, Some(json!({"a": 1})));
    }
}
