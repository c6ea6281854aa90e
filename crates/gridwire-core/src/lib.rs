//! Gridwire Core - reliable messaging between the grid editor host and
//! its embedded UI process.
//!
//! The underlying channel only promises unordered, best-effort delivery
//! of opaque frames: no acknowledgement, no timeout, no retry. This crate
//! imposes those semantics on top of it. Each process constructs one
//! [`Endpoint`] over an injected [`Transport`]; requests are correlated
//! by id, acknowledged on receipt, retransmitted on a bounded flat
//! schedule while unacknowledged, and failed with typed errors when the
//! peer never confirms or never answers. A PING/PONG heartbeat tracks
//! peer liveness independently of request traffic.
//!
//! Everything else in the editor (rendering, cell editing, clipboard,
//! CSV export) consumes `send_request` / `send_notification` /
//! `register_handler` and never touches the channel directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use gridwire_core::{Endpoint, EndpointConfig, transport::memory};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> gridwire_core::Result<()> {
//!     let (host_end, ui_end) = memory::duplex();
//!     let host = Endpoint::start(
//!         EndpointConfig::new().with_name("host"),
//!         host_end.transport,
//!         host_end.inbox,
//!     );
//!     let ui = Endpoint::start(
//!         EndpointConfig::new().with_name("ui"),
//!         ui_end.transport,
//!         ui_end.inbox,
//!     );
//!
//!     ui.register_handler_fn("updateCell", |payload| async move {
//!         // apply the edit to the table model...
//!         Ok(json!({"success": true}))
//!     });
//!
//!     let result = host
//!         .send_request("updateCell", json!({"row": 2, "col": 1, "value": "hi"}))
//!         .await?;
//!     assert_eq!(result, json!({"success": true}));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use config::{EndpointConfig, ProtocolConfig};
pub use correlation::CorrelationTracker;
pub use dispatch::{CommandHandler, HandlerRegistry};
pub use endpoint::{Endpoint, PendingCall};
pub use error::{GridwireError, Result};
pub use heartbeat::{HealthSnapshot, HealthState, HeartbeatMonitor};
pub use protocol::{commands, Message, MessageKind, ReplyErrorKind, ReplyPayload};
pub use retry::RetryPolicy;
pub use transport::{Inbox, Transport};
