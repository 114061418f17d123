use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::connection::{ConnAction, ConnEvent, ConnectionManager};
use crate::discovery::{DiscoveryClient, DiscoveryIntent, SignalingConnector};
use crate::events::{Event, EventBus};
use crate::protocol::{validate_join, ProtocolError};
use crate::registry::PeerRegistry;
use crate::room_code::{self, CodecError, RoomCodeCodec};
use crate::status::StatusAggregator;
use crate::transport::{LinkEvent, LinkHandle, LinkKind};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    InvalidRequest(#[from] ProtocolError),
    #[error("no link to peer: {0}")]
    NotConnected(String),
    #[error("transport unavailable")]
    Transport,
}

/// Timer ticks fed back into the event loop. Timers are fire-and-continue:
/// nothing on the event path waits on them.
#[derive(Debug)]
enum Tick {
    Retry { peer_id: String },
    NegotiationTimeout { peer_id: String, attempt: u32 },
}

/// Inbound application payload received from a peer on either link.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub peer_id: String,
    pub payload: Vec<u8>,
}

/// Owns everything for one joined room: peer registry, per-peer connection
/// state machines, the discovery session task, and the single event loop
/// that serializes all mutations.
///
/// All component state lives here rather than in module-level globals, so
/// `shutdown` can release every timer and task the session created. Events
/// from discovery, both transports, and timers funnel through one channel
/// per source into one loop, keeping peer-joined/peer-left races
/// deterministic by arrival order.
pub struct RoomSession {
    room_id: String,
    room_code: String,
    peer_id: String,
    config: MeshConfig,
    bus: EventBus,
    registry: PeerRegistry,
    connections: ConnectionManager,
    discovery: Arc<DiscoveryClient>,
    aggregator: StatusAggregator,
    direct: LinkHandle,
    relay: LinkHandle,
    /// Kept so `resume_discovery` can hand a respawned discovery task a
    /// sender into the still-running event loop.
    intents_tx: mpsc::Sender<DiscoveryIntent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    inbox: Mutex<Option<mpsc::Receiver<Inbound>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("room_code", &self.room_code)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    /// Join a room: register its code, wire the components, and spawn the
    /// discovery task and event loop.
    ///
    /// `direct` and `relay` are the command handle plus event stream of the
    /// respective transports; the relay side is expected to be backed by
    /// the already-open signaling channel.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        config: MeshConfig,
        connector: Arc<dyn SignalingConnector>,
        codec: RoomCodeCodec,
        direct: (LinkHandle, mpsc::Receiver<LinkEvent>),
        relay: (LinkHandle, mpsc::Receiver<LinkEvent>),
    ) -> Result<Arc<Self>, SessionError> {
        validate_join(room_id, peer_id, display_name)?;

        let room_code = room_code::encode(room_id);
        codec.register(&room_code, room_id).await?;

        let bus = EventBus::default();
        let registry = PeerRegistry::new(room_id, peer_id, bus.clone());
        let connections = ConnectionManager::new(config.clone(), bus.clone());
        let aggregator = StatusAggregator::new(registry.clone(), connections.clone());
        let discovery = Arc::new(DiscoveryClient::new(
            room_id,
            peer_id,
            display_name,
            config.clone(),
            registry.clone(),
            connector,
            bus.clone(),
        ));

        let (direct_handle, direct_events) = direct;
        let (relay_handle, relay_events) = relay;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (intents_tx, intents_rx) = mpsc::channel(config.channel_buffer);
        let (inbox_tx, inbox_rx) = mpsc::channel(config.channel_buffer);

        let session = Arc::new(Self {
            room_id: room_id.to_string(),
            room_code,
            peer_id: peer_id.to_string(),
            config,
            bus,
            registry,
            connections,
            discovery,
            aggregator,
            direct: direct_handle,
            relay: relay_handle,
            intents_tx: intents_tx.clone(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            inbox: Mutex::new(Some(inbox_rx)),
            closed: AtomicBool::new(false),
        });

        let discovery_task = {
            let discovery = session.discovery.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(err) = discovery.run(intents_tx, shutdown).await {
                    tracing::warn!(%err, "discovery task ended");
                }
            })
        };

        let loop_task = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .event_loop(intents_rx, direct_events, relay_events, inbox_tx, shutdown_rx)
                    .await;
            })
        };

        let mut tasks = session.tasks.lock().await;
        tasks.push(discovery_task);
        tasks.push(loop_task);
        drop(tasks);

        Ok(session)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The human-shareable code for this room.
    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// Take the inbound message stream. Yields payloads from both links.
    pub async fn take_inbox(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbox.lock().await.take()
    }

    /// Send a payload to a peer, preferring the direct link and falling
    /// back to relay. Fails if no link is open.
    pub async fn send_to(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        match self.connections.link_kind(peer_id).await {
            LinkKind::Direct => self
                .direct
                .send(peer_id, payload)
                .await
                .map_err(|_| SessionError::Transport),
            LinkKind::Relay => self
                .relay
                .send(peer_id, payload)
                .await
                .map_err(|_| SessionError::Transport),
            LinkKind::None => Err(SessionError::NotConnected(peer_id.to_string())),
        }
    }

    /// Manual restart of discovery after its reconnect budget exhausted.
    /// Clears the disabled flag and respawns the discovery task wired into
    /// the session's event loop. No-op while discovery is still running or
    /// after shutdown.
    pub async fn resume_discovery(&self) {
        if self.closed.load(Ordering::SeqCst) || !self.discovery.is_disabled() {
            return;
        }
        self.discovery.enable();

        let discovery = self.discovery.clone();
        let intents = self.intents_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            if let Err(err) = discovery.run(intents, shutdown).await {
                tracing::warn!(%err, "discovery task ended");
            }
        });
        self.tasks.lock().await.push(task);
        tracing::info!(room_id = %self.room_id, "discovery resumed manually");
    }

    /// Tear the room down: stop the event loop and discovery, close every
    /// peer link, and release all registry entries. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        for snap in self.connections.snapshot().await {
            let actions = self.connections.handle(&snap.peer_id, ConnEvent::Teardown).await;
            self.execute(&snap.peer_id, actions).await;
        }
        self.registry.clear().await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        self.bus.emit(Event::SessionClosed {
            room_id: self.room_id.clone(),
        });
        tracing::info!(room_id = %self.room_id, "room session closed");
    }

    async fn event_loop(
        self: Arc<Self>,
        mut intents: mpsc::Receiver<DiscoveryIntent>,
        mut direct_events: mpsc::Receiver<LinkEvent>,
        mut relay_events: mpsc::Receiver<LinkEvent>,
        inbox: mpsc::Sender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (tick_tx, mut ticks) = mpsc::channel::<Tick>(self.config.channel_buffer);
        // Sweep on the liveness timeout itself; a silent peer is gone after
        // at most two periods.
        let mut prune = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.liveness_timeout,
            self.config.liveness_timeout,
        );
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(intent) = intents.recv() => {
                    self.on_intent(intent, &tick_tx, &shutdown).await;
                }
                Some(event) = direct_events.recv() => {
                    self.on_link_event(LinkKind::Direct, event, &tick_tx, &inbox, &shutdown).await;
                }
                Some(event) = relay_events.recv() => {
                    self.on_link_event(LinkKind::Relay, event, &tick_tx, &inbox, &shutdown).await;
                }
                Some(tick) = ticks.recv() => {
                    let (peer_id, event) = match tick {
                        Tick::Retry { peer_id } => (peer_id, ConnEvent::RetryTick),
                        Tick::NegotiationTimeout { peer_id, attempt } => {
                            (peer_id, ConnEvent::NegotiationTimeout { attempt })
                        }
                    };
                    let actions = self.connections.handle(&peer_id, event).await;
                    self.execute_with_ticks(&peer_id, actions, &tick_tx, &shutdown).await;
                }
                _ = prune.tick() => {
                    let expired = self.registry.prune_stale(self.config.liveness_timeout).await;
                    for peer_id in expired {
                        tracing::debug!(%peer_id, "pruning silent peer");
                        let actions = self.connections.handle(&peer_id, ConnEvent::PeerLeft).await;
                        self.execute_with_ticks(&peer_id, actions, &tick_tx, &shutdown).await;
                    }
                }
                _ = shutdown.changed() => break,
                else => break,
            }
        }
    }

    async fn on_intent(
        &self,
        intent: DiscoveryIntent,
        ticks: &mpsc::Sender<Tick>,
        shutdown: &watch::Receiver<bool>,
    ) {
        match intent {
            DiscoveryIntent::PeerDiscovered { peer_id } => {
                let actions = self
                    .connections
                    .handle(&peer_id, ConnEvent::PeerDiscovered)
                    .await;
                self.execute_with_ticks(&peer_id, actions, ticks, shutdown).await;
                // Signaling metadata exchange rides on the discovery
                // channel; once the peer is announced both sides can
                // attempt a direct link.
                let actions = self
                    .connections
                    .handle(&peer_id, ConnEvent::SignalingReady)
                    .await;
                self.execute_with_ticks(&peer_id, actions, ticks, shutdown).await;
            }
            DiscoveryIntent::PeerLeft { peer_id } => {
                let actions = self.connections.handle(&peer_id, ConnEvent::PeerLeft).await;
                self.execute_with_ticks(&peer_id, actions, ticks, shutdown).await;
            }
            // Bus events for these are emitted by the discovery client;
            // working links are deliberately left alone.
            DiscoveryIntent::SessionLost
            | DiscoveryIntent::SessionResumed
            | DiscoveryIntent::Disabled => {}
        }
    }

    async fn on_link_event(
        &self,
        kind: LinkKind,
        event: LinkEvent,
        ticks: &mpsc::Sender<Tick>,
        inbox: &mpsc::Sender<Inbound>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let (peer_id, conn_event) = match (kind, event) {
            (_, LinkEvent::Message { peer_id, payload }) => {
                self.registry.touch(&peer_id).await;
                let _ = inbox.send(Inbound { peer_id, payload }).await;
                return;
            }
            (LinkKind::Direct, LinkEvent::Opened { peer_id }) => (peer_id, ConnEvent::DirectOpened),
            (LinkKind::Direct, LinkEvent::Failed { peer_id, reason }) => {
                (peer_id, ConnEvent::DirectFailed { reason })
            }
            (LinkKind::Direct, LinkEvent::Closed { peer_id }) => (peer_id, ConnEvent::DirectClosed),
            (_, LinkEvent::Opened { peer_id }) => (peer_id, ConnEvent::RelayOpened),
            // The relay path has no separate failure mode: a failed or
            // closed relay channel both mean the path is gone.
            (_, LinkEvent::Failed { peer_id, .. }) | (_, LinkEvent::Closed { peer_id }) => {
                (peer_id, ConnEvent::RelayClosed)
            }
        };

        let actions = self.connections.handle(&peer_id, conn_event).await;
        self.execute_with_ticks(&peer_id, actions, ticks, shutdown).await;
    }

    async fn execute_with_ticks(
        &self,
        peer_id: &str,
        actions: Vec<ConnAction>,
        ticks: &mpsc::Sender<Tick>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for action in &actions {
            match action {
                ConnAction::StartNegotiation { attempt } => {
                    self.arm_negotiation_timeout(peer_id, *attempt, ticks, shutdown);
                }
                ConnAction::ScheduleRetry { delay } => {
                    self.arm_retry(peer_id, *delay, ticks, shutdown);
                }
                _ => {}
            }
        }
        self.execute(peer_id, actions).await;
    }

    /// Run the transport-facing side effects of a transition. All sends are
    /// fire-and-continue; a dead transport is treated as a later Failed or
    /// Closed event, not an error here.
    async fn execute(&self, peer_id: &str, actions: Vec<ConnAction>) {
        for action in actions {
            match action {
                ConnAction::EnsureRelay => {
                    let _ = self.relay.negotiate(peer_id).await;
                }
                ConnAction::StartNegotiation { .. } => {
                    let _ = self.direct.negotiate(peer_id).await;
                }
                ConnAction::CloseLinks => {
                    let _ = self.direct.close(peer_id).await;
                    let _ = self.relay.close(peer_id).await;
                }
                // Timer actions are armed by execute_with_ticks; lifecycle
                // events are emitted by the connection manager.
                ConnAction::ScheduleRetry { .. }
                | ConnAction::Established { .. }
                | ConnAction::Lost { .. }
                | ConnAction::Unreachable => {}
            }
        }
    }

    fn arm_negotiation_timeout(
        &self,
        peer_id: &str,
        attempt: u32,
        ticks: &mpsc::Sender<Tick>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let peer_id = peer_id.to_string();
        let ticks = ticks.clone();
        let mut shutdown = shutdown.clone();
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = ticks.send(Tick::NegotiationTimeout { peer_id, attempt }).await;
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    fn arm_retry(
        &self,
        peer_id: &str,
        delay: std::time::Duration,
        ticks: &mpsc::Sender<Tick>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let peer_id = peer_id.to_string();
        let ticks = ticks.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = ticks.send(Tick::Retry { peer_id }).await;
                }
                _ = shutdown.changed() => {}
            }
        });
    }
}
