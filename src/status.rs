use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionManager, ConnectionSnapshot};
use crate::registry::PeerRegistry;

/// Counters and gauges for the mesh. Every field is always present and
/// zeroed by default: downstream consumers destructure this shape directly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshMetrics {
    pub total_attempts: u64,
    pub successful_direct: u64,
    pub failed_direct: u64,
    pub active_direct: u64,
    pub active_relay: u64,
    pub average_negotiation_time_ms: u64,
}

/// Read-only, point-in-time view of the mesh for external reporting.
/// Reads are eventually consistent with respect to in-flight transitions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSnapshot {
    pub metrics: MeshMetrics,
    pub connections: Vec<ConnectionSnapshot>,
    pub topology: HashMap<String, Vec<String>>,
}

/// Polls the registry and connection manager into a `MeshSnapshot`.
#[derive(Clone)]
pub struct StatusAggregator {
    registry: PeerRegistry,
    connections: ConnectionManager,
}

impl StatusAggregator {
    pub fn new(registry: PeerRegistry, connections: ConnectionManager) -> Self {
        Self {
            registry,
            connections,
        }
    }

    pub async fn snapshot(&self) -> MeshSnapshot {
        let stats = self.connections.stats().await;
        let (active_direct, active_relay) = self.connections.active_counts().await;
        let average_negotiation_time_ms = if stats.completed_negotiations > 0 {
            stats.total_negotiation_ms / stats.completed_negotiations
        } else {
            0
        };

        let mut peer_ids = self.registry.peer_ids().await;
        peer_ids.sort();
        let mut topology = HashMap::new();
        topology.insert(self.registry.room_id().to_string(), peer_ids);

        MeshSnapshot {
            metrics: MeshMetrics {
                total_attempts: stats.total_attempts,
                successful_direct: stats.successful_direct,
                failed_direct: stats.failed_direct,
                active_direct,
                active_relay,
                average_negotiation_time_ms,
            },
            connections: self.connections.snapshot().await,
            topology,
        }
    }
}
