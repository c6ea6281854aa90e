//! Transport seam between an endpoint and the underlying channel.
//!
//! The channel only promises unordered, best-effort delivery of opaque
//! frames. An endpoint is handed the outbound half as an injected
//! [`Transport`] and the inbound half as an `mpsc` receiver, so the layer
//! never touches a concrete host API directly and tests can substitute
//! lossy or recording transports.

use crate::{GridwireError, Result};
use tokio::sync::mpsc;

/// Outbound half of a channel. `send` hands one frame to the transport and
/// returns once the transport has accepted it; delivery is best-effort.
pub trait Transport: Send + Sync + 'static {
    /// Send one opaque frame. Fails only if the channel itself is gone.
    fn send(&self, frame: Vec<u8>) -> Result<()>;
}

/// Inbound half of a channel: frames as the peer's transport emitted them.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// In-process transports for tests and single-process hosts.
pub mod memory {
    use super::*;

    /// One direction of an in-process link.
    #[derive(Debug)]
    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Transport for MemoryTransport {
        fn send(&self, frame: Vec<u8>) -> Result<()> {
            self.tx
                .send(frame)
                .map_err(|_| GridwireError::ChannelClosed)
        }
    }

    /// One side of a duplex in-process channel.
    #[derive(Debug)]
    pub struct MemoryEnd {
        /// Outbound half, injected into an endpoint.
        pub transport: MemoryTransport,
        /// Inbound half, handed to the same endpoint.
        pub inbox: Inbox,
    }

    /// Create a linked pair of channel ends. Frames sent on one end's
    /// transport arrive in the other end's inbox.
    pub fn duplex() -> (MemoryEnd, MemoryEnd) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        (
            MemoryEnd {
                transport: MemoryTransport { tx: a_tx },
                inbox: a_rx,
            },
            MemoryEnd {
                transport: MemoryTransport { tx: b_tx },
                inbox: b_rx,
            },
        )
    }
}
