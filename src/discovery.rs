use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::MeshConfig;
use crate::events::{Event, EventBus};
use crate::protocol::{
    validate_join, validate_peer_info, ClientMessage, ProtocolError, ServerMessage,
};
use crate::registry::PeerRegistry;
use crate::retry::RetryDecision;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("rendezvous service unreachable")]
    Unreachable,
    #[error("discovery is disabled; manual re-enable required")]
    Disabled,
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error(transparent)]
    InvalidRequest(#[from] ProtocolError),
}

/// One logical control-channel session with the rendezvous service.
/// Transport-agnostic: whatever carries the wire messages hands the
/// coordinator this pair of channel halves.
#[derive(Debug)]
pub struct SignalingSession {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingSession {
    pub fn new(tx: mpsc::Sender<ClientMessage>, rx: mpsc::Receiver<ServerMessage>) -> Self {
        Self { tx, rx }
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<(), DiscoveryError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| DiscoveryError::ChannelClosed)
    }

    pub async fn recv(&mut self) -> Result<ServerMessage, DiscoveryError> {
        self.rx.recv().await.ok_or(DiscoveryError::ChannelClosed)
    }

    fn into_parts(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        (self.tx, self.rx)
    }
}

/// Create a linked session pair for testing: the client half plus the
/// server-side channel ends.
pub fn session_pair(
    buffer: usize,
) -> (
    SignalingSession,
    mpsc::Receiver<ClientMessage>,
    mpsc::Sender<ServerMessage>,
) {
    let (client_tx, server_rx) = mpsc::channel(buffer);
    let (server_tx, client_rx) = mpsc::channel(buffer);
    (SignalingSession::new(client_tx, client_rx), server_rx, server_tx)
}

/// Seam for establishing (and re-establishing) the signaling session. The
/// Reconnection Supervisor re-dials through this after a loss.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingSession, DiscoveryError>;
}

/// Peer-level intents the discovery client hands to the session loop, which
/// feeds them into the Connection Manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryIntent {
    PeerDiscovered { peer_id: String },
    PeerLeft { peer_id: String },
    SessionLost,
    SessionResumed,
    Disabled,
}

/// Maintains the discovery session for one (room, local peer) pair:
/// announces presence, keeps the session alive, translates server events
/// into registry updates and connection intents, and resumes after losses
/// under the retry budget.
///
/// Discovery failure never tears down working connections: on loss the
/// registry is marked stale but retained, and after budget exhaustion
/// discovery is disabled until `enable` is called.
pub struct DiscoveryClient {
    room_id: String,
    peer_id: String,
    display_name: String,
    config: MeshConfig,
    registry: PeerRegistry,
    connector: Arc<dyn SignalingConnector>,
    bus: EventBus,
    disabled: Arc<AtomicBool>,
}

impl DiscoveryClient {
    pub fn new(
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        config: MeshConfig,
        registry: PeerRegistry,
        connector: Arc<dyn SignalingConnector>,
        bus: EventBus,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            config,
            registry,
            connector,
            bus,
            disabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Manual re-enable after budget exhaustion. The caller restarts `run`.
    pub fn enable(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }

    /// Drive the discovery session until shutdown, or until the reconnect
    /// budget is exhausted (discovery disabled).
    pub async fn run(
        &self,
        intents: mpsc::Sender<DiscoveryIntent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        validate_join(&self.room_id, &self.peer_id, &self.display_name)?;
        if self.is_disabled() {
            return Err(DiscoveryError::Disabled);
        }

        let mut budget = self.config.discovery_retry.budget();
        let mut was_lost = false;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let joined = match self.connector.connect().await {
                Ok(session) => {
                    match session
                        .send(ClientMessage::JoinRoom {
                            room_id: self.room_id.clone(),
                            peer_id: self.peer_id.clone(),
                            display_name: self.display_name.clone(),
                        })
                        .await
                    {
                        Ok(()) => Some(session),
                        Err(_) => None,
                    }
                }
                Err(err) => {
                    tracing::debug!(room_id = %self.room_id, %err, "discovery connect failed");
                    None
                }
            };

            if let Some(session) = joined {
                budget.reset();
                self.registry.mark_fresh();
                if was_lost {
                    was_lost = false;
                    self.bus.emit(Event::DiscoveryResumed {
                        room_id: self.room_id.clone(),
                    });
                    let _ = intents.send(DiscoveryIntent::SessionResumed).await;
                }
                tracing::info!(room_id = %self.room_id, peer_id = %self.peer_id, "discovery session joined");

                let lost = self.serve(session, &intents, &mut shutdown).await;
                if !lost {
                    return Ok(());
                }
            }

            // Session lost or never established. Peers may still be
            // reachable over direct links, so the registry is only marked
            // stale, never cleared.
            was_lost = true;
            self.registry.mark_stale();
            self.bus.emit(Event::DiscoveryStale {
                room_id: self.room_id.clone(),
            });
            let _ = intents.send(DiscoveryIntent::SessionLost).await;

            match budget.record_failure(Instant::now()) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(room_id = %self.room_id, ?delay, "discovery reconnect scheduled");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
                RetryDecision::Exhausted => {
                    tracing::warn!(room_id = %self.room_id, "discovery reconnect budget exhausted, disabling");
                    self.disabled.store(true, Ordering::SeqCst);
                    self.bus.emit(Event::DiscoveryDisabled {
                        room_id: self.room_id.clone(),
                    });
                    let _ = intents.send(DiscoveryIntent::Disabled).await;
                    return Err(DiscoveryError::Unreachable);
                }
            }
        }
    }

    /// Serve one established session. Returns true if the session was lost
    /// (reconnect wanted), false on shutdown.
    async fn serve(
        &self,
        session: SignalingSession,
        intents: &mpsc::Sender<DiscoveryIntent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let (tx, mut rx) = session.into_parts();
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately and sends the opening ping.
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ServerMessage::Pong) => {
                        awaiting_pong = None;
                    }
                    Some(msg) => self.apply(msg, intents).await,
                    None => return true,
                },
                _ = keepalive.tick() => {
                    if let Some(since) = awaiting_pong {
                        if since.elapsed() >= self.config.pong_window {
                            tracing::debug!(room_id = %self.room_id, "pong window elapsed, treating session as lost");
                            return true;
                        }
                    }
                    if tx.send(ClientMessage::Ping).await.is_err() {
                        return true;
                    }
                    if awaiting_pong.is_none() {
                        awaiting_pong = Some(Instant::now());
                    }
                }
                _ = shutdown.changed() => return false,
            }
        }
    }

    /// Translate one server event into registry updates and intents.
    /// Last-write-wins by arrival order: a snapshot fully replaces the set
    /// even if an incremental event arrived first.
    async fn apply(&self, msg: ServerMessage, intents: &mpsc::Sender<DiscoveryIntent>) {
        match msg {
            ServerMessage::RoomPeers { peers } => {
                let peers = peers
                    .into_iter()
                    .filter(|p| match validate_peer_info(p) {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!(%err, "dropping malformed snapshot entry");
                            false
                        }
                    })
                    .collect();
                let (added, removed) = self.registry.apply_snapshot(peers).await;
                for peer_id in added {
                    let _ = intents.send(DiscoveryIntent::PeerDiscovered { peer_id }).await;
                }
                for peer_id in removed {
                    let _ = intents.send(DiscoveryIntent::PeerLeft { peer_id }).await;
                }
            }
            ServerMessage::PeerJoined { peer } => {
                if let Err(err) = validate_peer_info(&peer) {
                    tracing::warn!(%err, "dropping malformed join event");
                    return;
                }
                let peer_id = peer.peer_id.clone();
                // Duplicate joins for a known peer are dropped silently.
                if self.registry.apply_join(peer).await {
                    let _ = intents.send(DiscoveryIntent::PeerDiscovered { peer_id }).await;
                }
            }
            ServerMessage::PeerLeft { peer_id } => {
                if self.registry.apply_leave(&peer_id).await.is_some() {
                    let _ = intents.send(DiscoveryIntent::PeerLeft { peer_id }).await;
                }
            }
            ServerMessage::Pong => {}
        }
    }
}
