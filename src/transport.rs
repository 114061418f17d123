use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Which path carries traffic to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    None,
    Relay,
    Direct,
}

/// Commands issued to a link transport. All calls are fire-and-continue:
/// outcomes come back as `LinkEvent`s, never as blocking returns.
#[derive(Clone, Debug)]
pub enum LinkCommand {
    /// Begin negotiating a channel to the peer.
    Negotiate { peer_id: String },
    Send { peer_id: String, payload: Vec<u8> },
    Close { peer_id: String },
}

/// Events reported by a link transport.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A writable channel to the peer is open.
    Opened { peer_id: String },
    /// Negotiation failed or timed out.
    Failed { peer_id: String, reason: String },
    Message { peer_id: String, payload: Vec<u8> },
    /// A previously open channel closed.
    Closed { peer_id: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Command half of a link transport, held by the coordinator. The direct
/// and relay transports expose the same shape; the relay handle is backed
/// by the already-open signaling session repurposed for data.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    kind: LinkKind,
    tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub fn new(kind: LinkKind, tx: mpsc::Sender<LinkCommand>) -> Self {
        Self { kind, tx }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub async fn negotiate(&self, peer_id: &str) -> Result<(), TransportError> {
        self.command(LinkCommand::Negotiate {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    pub async fn send(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.command(LinkCommand::Send {
            peer_id: peer_id.to_string(),
            payload,
        })
        .await
    }

    pub async fn close(&self, peer_id: &str) -> Result<(), TransportError> {
        self.command(LinkCommand::Close {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    async fn command(&self, cmd: LinkCommand) -> Result<(), TransportError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Create a linked transport pair for testing: the coordinator side gets a
/// `LinkHandle` plus the event receiver, the fake-transport side gets the
/// command receiver plus the event sender.
pub fn link_pair(
    kind: LinkKind,
    buffer: usize,
) -> (
    LinkHandle,
    mpsc::Receiver<LinkEvent>,
    mpsc::Receiver<LinkCommand>,
    mpsc::Sender<LinkEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
    let (event_tx, event_rx) = mpsc::channel(buffer);
    (LinkHandle::new(kind, cmd_tx), event_rx, cmd_rx, event_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_reach_the_transport() {
        let (handle, _events, mut cmd_rx, _event_tx) = link_pair(LinkKind::Direct, 8);

        handle.negotiate("peer:bob").await.unwrap();
        match cmd_rx.recv().await.unwrap() {
            LinkCommand::Negotiate { peer_id } => assert_eq!(peer_id, "peer:bob"),
            other => panic!("unexpected command: {other:?}"),
        }

        handle.send("peer:bob", b"hi".to_vec()).await.unwrap();
        match cmd_rx.recv().await.unwrap() {
            LinkCommand::Send { peer_id, payload } => {
                assert_eq!(peer_id, "peer:bob");
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_reach_the_coordinator() {
        let (_handle, mut events, _cmd_rx, event_tx) = link_pair(LinkKind::Relay, 8);

        event_tx
            .send(LinkEvent::Opened {
                peer_id: "peer:bob".into(),
            })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            LinkEvent::Opened { peer_id } => assert_eq!(peer_id, "peer:bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_transport_surfaces_channel_closed() {
        let (handle, _events, cmd_rx, _event_tx) = link_pair(LinkKind::Direct, 8);
        drop(cmd_rx);

        let err = handle.negotiate("peer:bob").await.unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }
}
