//! Wire protocol types and codec.
//!
//! Every frame on the channel is the UTF-8 JSON encoding of one [`Message`].
//! The `kind` field is an exhaustive tagged union decoded once here; decode
//! failures (missing required fields, unrecognized kind, oversized frame)
//! surface as `MalformedMessage` and are dropped by the receive loop, never
//! propagated to a request caller.

use crate::config::ProtocolConfig;
use crate::{GridwireError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Commands the messaging layer itself uses. Consumer commands (cell
/// edits, row moves, clipboard ranges) are opaque strings defined by the
/// editor on top of this layer.
pub mod commands {
    /// Periodic full state-resynchronization request, sent by the resync
    /// timer to repair drift from missed notifications.
    pub const SYNC_STATE: &str = "syncState";
}

/// The six recognized message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Ack,
    Ping,
    Pong,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Response => write!(f, "RESPONSE"),
            MessageKind::Notification => write!(f, "NOTIFICATION"),
            MessageKind::Ack => write!(f, "ACK"),
            MessageKind::Ping => write!(f, "PING"),
            MessageKind::Pong => write!(f, "PONG"),
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Process-unique id, generated by the sender.
    pub id: String,
    pub kind: MessageKind,
    /// Meaningful for REQUEST and NOTIFICATION.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// On RESPONSE and ACK: the id of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Sender-side clock reading in milliseconds, non-decreasing per sender.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    fn new(
        kind: MessageKind,
        command: Option<String>,
        correlation_id: Option<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            command,
            correlation_id,
            timestamp: now_ms(),
            payload,
        }
    }

    /// Frame a REQUEST for the given command.
    pub fn request(command: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Request, Some(command.into()), None, Some(payload))
    }

    /// Frame a NOTIFICATION for the given command.
    pub fn notification(command: impl Into<String>, payload: Value) -> Self {
        Self::new(
            MessageKind::Notification,
            Some(command.into()),
            None,
            Some(payload),
        )
    }

    /// Frame a RESPONSE answering `correlation_id`.
    pub fn response(correlation_id: impl Into<String>, reply: ReplyPayload) -> Result<Self> {
        let payload = serde_json::to_value(reply)?;
        Ok(Self::new(
            MessageKind::Response,
            None,
            Some(correlation_id.into()),
            Some(payload),
        ))
    }

    /// Frame an ACK answering `correlation_id`.
    pub fn ack(correlation_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Ack, None, Some(correlation_id.into()), None)
    }

    /// Frame a PING carrying the current timestamp as its payload.
    pub fn ping() -> Self {
        let mut msg = Self::new(MessageKind::Ping, None, None, None);
        msg.payload = Some(Value::from(msg.timestamp));
        msg
    }

    /// Frame a PONG echoing the timestamp payload of the PING it answers.
    pub fn pong(echoed: Option<Value>) -> Self {
        Self::new(MessageKind::Pong, None, None, echoed)
    }
}

/// Payload convention carried by every RESPONSE: either a success value or
/// a failure description, so the requesting side can resolve or reject on
/// `success` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

/// Failure description inside a RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyError {
    pub kind: ReplyErrorKind,
    pub message: String,
}

/// Distinguishes the two ways a request can fail on the answering side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyErrorKind {
    CommandNotSupported,
    HandlerFailure,
}

impl ReplyPayload {
    /// A successful reply carrying `value`.
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    /// A failed reply.
    pub fn fail(kind: ReplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(ReplyError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Convert into the outcome delivered to the request caller.
    ///
    /// `command` is the command of the original request, used for error
    /// context; a failed reply with no error description maps to a
    /// handler failure.
    pub fn into_outcome(self, command: &str) -> Result<Value> {
        if self.success {
            return Ok(self.value.unwrap_or(Value::Null));
        }
        match self.error {
            Some(err) => match err.kind {
                ReplyErrorKind::CommandNotSupported => Err(GridwireError::CommandNotSupported {
                    command: command.to_string(),
                }),
                ReplyErrorKind::HandlerFailure => Err(GridwireError::HandlerFailure {
                    command: command.to_string(),
                    message: err.message,
                }),
            },
            None => Err(GridwireError::HandlerFailure {
                command: command.to_string(),
                message: "peer reported failure with no description".to_string(),
            }),
        }
    }
}

/// Encode a message into a wire frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a wire frame into a message.
///
/// Rejects oversized frames before parsing and maps any JSON/shape failure
/// to `MalformedMessage`.
pub fn decode(frame: &[u8]) -> Result<Message> {
    if frame.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(GridwireError::MalformedMessage {
            message: format!(
                "frame size {} exceeds maximum {}",
                frame.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
            source: None,
        });
    }

    serde_json::from_slice(frame).map_err(|e| GridwireError::MalformedMessage {
        message: format!("invalid message frame: {}", e),
        source: Some(e),
    })
}

/// Current wall clock in milliseconds, ratcheted so consecutive readings
/// from one process never decrease even if the system clock steps back.
pub(crate) fn now_ms() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let wall = chrono::Utc::now().timestamp_millis();
    let prev = LAST.fetch_max(wall, Ordering::SeqCst);
    prev.max(wall)
}
