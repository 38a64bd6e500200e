//! Peers and the read-only membership view.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl PeerState {
    /// Dead and Left only change through a higher incarnation.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Dead | PeerState::Left)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Alive => "alive",
            PeerState::Suspect => "suspect",
            PeerState::Dead => "dead",
            PeerState::Left => "left",
        };
        f.write_str(s)
    }
}

/// A claim about one peer, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub state: PeerState,
}

/// A peer as recorded in the local membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub state: PeerState,
    /// Epoch milliseconds of the last state change.
    pub state_changed_at: u64,
}

impl Member {
    pub fn to_update(&self) -> PeerUpdate {
        PeerUpdate {
            name: self.name.clone(),
            addr: self.addr,
            incarnation: self.incarnation,
            state: self.state,
        }
    }
}

/// Snapshot of the membership table, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipView {
    local: String,
    members: BTreeMap<String, Member>,
}

impl MembershipView {
    pub fn new(local: &str, members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            local: local.to_string(),
            members: members.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    /// Name of the node this view belongs to.
    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn local(&self) -> Option<&Member> {
        self.members.get(&self.local)
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.members
            .get(name)
            .is_some_and(|m| m.state == PeerState::Alive)
    }

    /// Names of the peers currently Alive, in name order.
    pub fn alive(&self) -> Vec<&str> {
        self.members
            .values()
            .filter(|m| m.state == PeerState::Alive)
            .map(|m| m.name.as_str())
            .collect()
    }

    /// Name and state of every member, for comparing views.
    pub fn states(&self) -> BTreeMap<String, (u64, PeerState)> {
        self.members
            .values()
            .map(|m| (m.name.clone(), (m.incarnation, m.state)))
            .collect()
    }
}
