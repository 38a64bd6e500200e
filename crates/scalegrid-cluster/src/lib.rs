//! scalegrid-cluster — decentralized membership for scalegrid nodes.
//!
//! Every node runs a SWIM-style failure detector: it probes one random
//! peer per probe interval, asks a few relays to probe indirectly when a
//! direct probe goes unanswered, and spreads state changes by piggybacking
//! them on protocol packets. A slower push-pull exchange of full state
//! repairs whatever gossip missed.
//!
//! # Architecture
//!
//! ```text
//! Peer (lifecycle: start / join / leave / shutdown)
//!   └── Detector
//!       ├── MemberTable     — incarnation-ordered peer states
//!       ├── BroadcastQueue  — events piggybacked on outbound packets
//!       ├── History         — recent events replayed to joining peers
//!       └── Transport
//!           ├── NetTransport     — UDP packets + TCP push-pull
//!           └── MemoryTransport  — in-process, lossy, for simulations
//! ```
//!
//! The only coupling to the rest of scalegrid is the read-only
//! [`MembershipView`] returned by [`Peer::members`] and [`Peer::subscribe`].

pub mod broadcast;
pub mod config;
mod detector;
pub mod error;
pub mod member;
pub mod memory;
pub mod message;
pub mod net;
pub mod peer;
pub mod table;
pub mod transport;

pub use config::PeerConfig;
pub use error::{ClusterError, ClusterResult};
pub use member::{Member, MembershipView, PeerState, PeerUpdate};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use net::NetTransport;
pub use peer::Peer;
pub use transport::{Inbound, Transport};
