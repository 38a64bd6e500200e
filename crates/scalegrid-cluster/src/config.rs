//! Peer configuration and the timing formulas derived from it.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ClusterError, ClusterResult};

/// Capacity of the broadcast queue.
pub const BROADCAST_QUEUE_CAPACITY: usize = 256;

/// Capacity of the event history replayed to joining peers.
pub const HISTORY_CAPACITY: usize = 128;

/// Maximum number of piggybacked events per packet.
pub const MAX_PIGGYBACK: usize = 16;

/// Configuration of a single cluster peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Unique node name.
    pub name: String,
    /// Address the packet and stream listeners bind to.
    pub bind_addr: SocketAddr,
    /// Address announced to other peers. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    /// Number of random peers each gossip round targets.
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    /// Bound on every push-pull stream exchange.
    pub tcp_timeout: Duration,
    /// Number of relays asked to probe an unresponsive peer.
    pub indirect_checks: usize,
    pub suspicion_mult: u32,
    pub retransmit_mult: u32,
    /// How long `leave` waits for the Left event to be acknowledged.
    pub leave_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "scalegrid".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8601)),
            advertise_addr: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(60),
            tcp_timeout: Duration::from_secs(10),
            indirect_checks: 3,
            suspicion_mult: 4,
            retransmit_mult: 4,
            leave_timeout: Duration::from_secs(15),
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.name.trim().is_empty() {
            return Err(ClusterError::Config("node name cannot be empty".to_string()));
        }
        let timings = [
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("gossip_interval", self.gossip_interval),
            ("push_pull_interval", self.push_pull_interval),
            ("tcp_timeout", self.tcp_timeout),
            ("leave_timeout", self.leave_timeout),
        ];
        for (field, value) in timings {
            if value.is_zero() {
                return Err(ClusterError::Config(format!("{field} must be positive")));
            }
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(ClusterError::Config(
                "probe_timeout must be shorter than probe_interval".to_string(),
            ));
        }
        if self.suspicion_mult == 0 || self.retransmit_mult == 0 {
            return Err(ClusterError::Config(
                "suspicion_mult and retransmit_mult must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// How long a peer stays Suspect before it is declared Dead, for a
    /// cluster of `n` members.
    pub fn suspicion_timeout(&self, n: usize) -> Duration {
        let scale = log10_ceil(n).max(1);
        let timeout = self.probe_timeout * self.suspicion_mult * scale;
        timeout.max(self.probe_interval)
    }

    /// Times each broadcast is retransmitted in a cluster of `n` members.
    pub fn retransmit_limit(&self, n: usize) -> u32 {
        self.retransmit_mult * log10_ceil(n + 1).max(1)
    }
}

/// ⌈log10(n)⌉ for n ≥ 1, and 0 for n ≤ 1.
fn log10_ceil(n: usize) -> u32 {
    let mut scale = 0;
    let mut reach = 1usize;
    while reach < n {
        reach = reach.saturating_mul(10);
        scale += 1;
    }
    scale
}
