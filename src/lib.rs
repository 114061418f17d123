pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod room_code;
pub mod session;
pub mod status;
pub mod transport;

pub use config::MeshConfig;
pub use connection::{
    step, ConnAction, ConnEvent, ConnectionManager, ConnectionSnapshot, ConnectionState,
    NegotiationStats, Phase,
};
pub use discovery::{
    session_pair, DiscoveryClient, DiscoveryError, DiscoveryIntent, SignalingConnector,
    SignalingSession,
};
pub use events::{Event, EventBus};
pub use protocol::{ClientMessage, PeerInfo, ProtocolError, ServerMessage};
pub use registry::{Peer, PeerRegistry};
pub use retry::{RetryBudget, RetryDecision, RetryPolicy};
pub use room_code::{encode, CodecError, RoomCodeCodec};
pub use session::{Inbound, RoomSession, SessionError};
pub use status::{MeshMetrics, MeshSnapshot, StatusAggregator};
pub use transport::{
    link_pair, LinkCommand, LinkEvent, LinkHandle, LinkKind, TransportError,
};
