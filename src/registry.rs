use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::{Event, EventBus};
use crate::protocol::PeerInfo;

/// A known remote participant in a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub display_name: String,
    pub room_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// In-memory registry of the peers known in a single room (thread-safe).
///
/// The local peer is never stored: discovery events naming it are filtered
/// out by identity comparison. Uniqueness key is `(room_id, peer_id)`; one
/// registry instance covers one room. Mutations come from the discovery
/// client only, over the session's single event loop.
#[derive(Clone)]
pub struct PeerRegistry {
    room_id: String,
    local_peer_id: String,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    /// Set when the discovery session is lost; entries are retained because
    /// peers may still be reachable over established direct links.
    stale: Arc<AtomicBool>,
    bus: EventBus,
}

impl PeerRegistry {
    pub fn new(room_id: &str, local_peer_id: &str, bus: EventBus) -> Self {
        Self {
            room_id: room_id.to_string(),
            local_peer_id: local_peer_id.to_string(),
            peers: Arc::new(RwLock::new(HashMap::new())),
            stale: Arc::new(AtomicBool::new(false)),
            bus,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    fn entry_from_info(&self, info: PeerInfo, now: DateTime<Utc>) -> Peer {
        Peer {
            peer_id: info.peer_id,
            display_name: info.display_name,
            room_id: self.room_id.clone(),
            joined_at: info.joined_at.unwrap_or(now),
            last_seen_at: now,
        }
    }

    /// Replace the room's peer set with a full snapshot, excluding the local
    /// peer. Returns the ids that are new and the ids that disappeared.
    pub async fn apply_snapshot(&self, snapshot: Vec<PeerInfo>) -> (Vec<String>, Vec<String>) {
        let now = Utc::now();
        let mut next = HashMap::new();
        for info in snapshot {
            if info.peer_id == self.local_peer_id || info.peer_id.trim().is_empty() {
                continue;
            }
            next.insert(info.peer_id.clone(), self.entry_from_info(info, now));
        }

        let mut peers = self.peers.write().await;
        let added: Vec<String> = next
            .keys()
            .filter(|id| !peers.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<String> = peers
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        // Keep original join times for peers that survive the replace.
        for (id, entry) in next.iter_mut() {
            if let Some(existing) = peers.get(id) {
                entry.joined_at = existing.joined_at;
            }
        }
        *peers = next;
        drop(peers);

        for id in &added {
            self.bus.emit(Event::PeerDiscovered {
                peer_id: id.clone(),
                room_id: self.room_id.clone(),
            });
        }
        for id in &removed {
            self.bus.emit(Event::PeerDeparted {
                peer_id: id.clone(),
                room_id: self.room_id.clone(),
            });
        }
        (added, removed)
    }

    /// Insert a newly joined peer. Idempotent: a duplicate join for an
    /// already-known peer only refreshes `last_seen_at` and returns false.
    pub async fn apply_join(&self, info: PeerInfo) -> bool {
        if info.peer_id == self.local_peer_id {
            return false;
        }
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get_mut(&info.peer_id) {
            existing.last_seen_at = now;
            return false;
        }
        let peer_id = info.peer_id.clone();
        peers.insert(peer_id.clone(), self.entry_from_info(info, now));
        drop(peers);

        self.bus.emit(Event::PeerDiscovered {
            peer_id,
            room_id: self.room_id.clone(),
        });
        true
    }

    /// Remove a departed peer. Returns the removed entry, if any.
    pub async fn apply_leave(&self, peer_id: &str) -> Option<Peer> {
        let removed = self.peers.write().await.remove(peer_id);
        if removed.is_some() {
            self.bus.emit(Event::PeerDeparted {
                peer_id: peer_id.to_string(),
                room_id: self.room_id.clone(),
            });
        }
        removed
    }

    /// Refresh a peer's liveness timestamp.
    pub async fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().await.get_mut(peer_id) {
            peer.last_seen_at = Utc::now();
        }
    }

    /// Remove peers not seen within the liveness timeout. Returns the
    /// pruned ids.
    pub async fn prune_stale(&self, liveness_timeout: std::time::Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(liveness_timeout).unwrap_or(ChronoDuration::seconds(90));
        let mut peers = self.peers.write().await;
        let expired: Vec<String> = peers
            .iter()
            .filter(|(_, p)| p.last_seen_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            peers.remove(id);
        }
        drop(peers);

        for id in &expired {
            self.bus.emit(Event::PeerDeparted {
                peer_id: id.clone(),
                room_id: self.room_id.clone(),
            });
        }
        expired
    }

    pub async fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn list(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Discovery loss marker. The peer set is intentionally retained.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn mark_fresh(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Drop every entry for the room (session teardown).
    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> PeerRegistry {
        PeerRegistry::new("main-stage", "peer:me", EventBus::default())
    }

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: format!("peer:{id}"),
            display_name: id.to_string(),
            joined_at: None,
        }
    }

    #[tokio::test]
    async fn join_and_lookup() {
        let reg = make_registry();
        assert!(reg.apply_join(info("alice")).await);

        let peer = reg.get("peer:alice").await.unwrap();
        assert_eq!(peer.display_name, "alice");
        assert_eq!(peer.room_id, "main-stage");
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_join_is_idempotent() {
        let reg = make_registry();
        assert!(reg.apply_join(info("alice")).await);
        assert!(!reg.apply_join(info("alice")).await);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn local_peer_is_never_stored() {
        let reg = make_registry();
        let me = PeerInfo {
            peer_id: "peer:me".into(),
            display_name: "Me".into(),
            joined_at: None,
        };
        assert!(!reg.apply_join(me.clone()).await);
        assert!(reg.is_empty().await);

        reg.apply_snapshot(vec![me, info("alice")]).await;
        assert!(!reg.contains("peer:me").await);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_replaces_set() {
        let reg = make_registry();
        reg.apply_join(info("alice")).await;
        reg.apply_join(info("bob")).await;

        let (added, removed) = reg.apply_snapshot(vec![info("bob"), info("carol")]).await;
        assert_eq!(added, vec!["peer:carol".to_string()]);
        assert_eq!(removed, vec!["peer:alice".to_string()]);
        assert!(reg.contains("peer:bob").await);
        assert!(reg.contains("peer:carol").await);
        assert!(!reg.contains("peer:alice").await);
    }

    #[tokio::test]
    async fn snapshot_preserves_join_time_of_survivors() {
        let reg = make_registry();
        reg.apply_join(info("bob")).await;
        let joined = reg.get("peer:bob").await.unwrap().joined_at;

        reg.apply_snapshot(vec![info("bob")]).await;
        assert_eq!(reg.get("peer:bob").await.unwrap().joined_at, joined);
    }

    #[tokio::test]
    async fn leave_removes_peer() {
        let reg = make_registry();
        reg.apply_join(info("alice")).await;
        assert!(reg.apply_leave("peer:alice").await.is_some());
        assert!(reg.apply_leave("peer:alice").await.is_none());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn no_duplicate_entries_under_event_mix() {
        let reg = make_registry();
        reg.apply_snapshot(vec![info("alice"), info("alice")]).await;
        assert_eq!(reg.len().await, 1);

        reg.apply_join(info("alice")).await;
        reg.apply_join(info("alice")).await;
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn prune_removes_silent_peers() {
        let reg = make_registry();
        reg.apply_join(info("alice")).await;

        // Nothing is stale within a generous timeout.
        assert!(reg
            .prune_stale(std::time::Duration::from_secs(3600))
            .await
            .is_empty());

        // Everything is stale with a zero timeout.
        let pruned = reg.prune_stale(std::time::Duration::ZERO).await;
        assert_eq!(pruned, vec!["peer:alice".to_string()]);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn stale_flag_does_not_clear_entries() {
        let reg = make_registry();
        reg.apply_join(info("alice")).await;

        reg.mark_stale();
        assert!(reg.is_stale());
        assert_eq!(reg.len().await, 1);

        reg.mark_fresh();
        assert!(!reg.is_stale());
    }

    #[tokio::test]
    async fn events_emitted_on_discovery_and_departure() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let reg = PeerRegistry::new("main-stage", "peer:me", bus);

        reg.apply_join(info("alice")).await;
        let e = rx.recv().await.unwrap();
        assert!(matches!(e, Event::PeerDiscovered { .. }));

        reg.apply_leave("peer:alice").await;
        let e = rx.recv().await.unwrap();
        assert!(matches!(e, Event::PeerDeparted { .. }));
    }
}
