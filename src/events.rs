use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::transport::LinkKind;

/// Mesh lifecycle events emitted by the discovery, connection, and session
/// subsystems.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    PeerDiscovered {
        peer_id: String,
        room_id: String,
    },
    PeerDeparted {
        peer_id: String,
        room_id: String,
    },
    LinkEstablished {
        peer_id: String,
        kind: LinkKind,
    },
    LinkLost {
        peer_id: String,
        kind: LinkKind,
    },
    /// Direct negotiation retries exhausted; the peer stays unreachable
    /// until a fresh discovery event for it arrives.
    PeerUnreachable {
        peer_id: String,
    },
    DiscoveryStale {
        room_id: String,
    },
    DiscoveryResumed {
        room_id: String,
    },
    /// Reconnect budget exhausted; discovery stays off until re-enabled.
    DiscoveryDisabled {
        room_id: String,
    },
    SessionClosed {
        room_id: String,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event bus for decoupled mesh components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
