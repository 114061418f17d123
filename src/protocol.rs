use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Peer fields as they appear on the signaling wire. `joined_at` is optional
/// on the wire; receivers default it to the arrival time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

/// Client→server messages on the signaling channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
    },
    Ping,
}

/// Server→client messages on the signaling channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot of the room's current peers.
    RoomPeers { peers: Vec<PeerInfo> },
    PeerJoined { peer: PeerInfo },
    PeerLeft { peer_id: String },
    Pong,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Validate a join announcement before it goes on the wire. Malformed
/// payloads are rejected immediately and never retried.
pub fn validate_join(
    room_id: &str,
    peer_id: &str,
    display_name: &str,
) -> Result<(), ProtocolError> {
    if room_id.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest("empty room_id".into()));
    }
    if peer_id.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest("empty peer_id".into()));
    }
    if display_name.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest("empty display_name".into()));
    }
    Ok(())
}

/// Validate a peer record received from the server. Entries with an empty
/// id are dropped by the caller.
pub fn validate_peer_info(info: &PeerInfo) -> Result<(), ProtocolError> {
    if info.peer_id.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest("empty peer_id".into()));
    }
    Ok(())
}
