use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for a room session: timers, deadlines, and retry budgets.
///
/// Every timer in the coordinator reads from here; nothing hardcodes a
/// duration at the call site.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Interval between keepalive pings on the signaling session.
    pub keepalive_interval: Duration,
    /// How long to wait for a pong before treating the session as lost.
    pub pong_window: Duration,
    /// Attempt-scoped ceiling for a single direct-link negotiation.
    pub negotiation_timeout: Duration,
    /// Peers not seen for this long are pruned from the registry.
    pub liveness_timeout: Duration,
    /// Retry policy for re-establishing the discovery session.
    pub discovery_retry: RetryPolicy,
    /// Retry policy for per-peer negotiation and re-upgrade attempts.
    pub negotiation_retry: RetryPolicy,
    /// Buffer size for internal channels.
    pub channel_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            pong_window: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(90),
            discovery_retry: RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30)),
            negotiation_retry: RetryPolicy::new(4, Duration::from_secs(2), Duration::from_secs(60)),
            channel_buffer: 64,
        }
    }
}
