//! Membership table and the rules for applying peer updates.
//!
//! Two rule sets exist. Gossip (single events piggybacked on packets) uses
//! SWIM precedence. Push-pull (full state exchange) compares incarnations:
//! the higher one wins, and at equal incarnation Alive beats Suspect while
//! Dead and Left are final. Neither path ever lowers a recorded incarnation.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::member::{Member, MembershipView, PeerState, PeerUpdate};

/// Result of applying one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The update was stale or redundant.
    Ignored,
    /// A peer entry changed; the update should be re-disseminated.
    Changed {
        update: PeerUpdate,
        previous: Option<PeerState>,
    },
    /// The update was a rumour about this node; the local incarnation was
    /// raised and the returned Alive update must be broadcast.
    Refuted(PeerUpdate),
}

#[derive(Debug, Clone)]
pub struct MemberTable {
    local: Member,
    peers: BTreeMap<String, Member>,
}

impl MemberTable {
    pub fn new(name: &str, addr: SocketAddr, now_ms: u64) -> Self {
        Self {
            local: Member {
                name: name.to_string(),
                addr,
                incarnation: 0,
                state: PeerState::Alive,
                state_changed_at: now_ms,
            },
            peers: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        if name == self.local.name {
            Some(&self.local)
        } else {
            self.peers.get(name)
        }
    }

    /// Number of known members, including this node.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn peers(&self) -> impl Iterator<Item = &Member> {
        self.peers.values()
    }

    /// Every member, this node included, as wire updates.
    pub fn updates(&self) -> Vec<PeerUpdate> {
        std::iter::once(&self.local)
            .chain(self.peers.values())
            .map(Member::to_update)
            .collect()
    }

    pub fn view(&self) -> MembershipView {
        let members = std::iter::once(&self.local).chain(self.peers.values()).cloned();
        MembershipView::new(&self.local.name, members)
    }

    /// Apply an event received through gossip.
    pub fn apply_gossip(&mut self, update: &PeerUpdate, now_ms: u64) -> Applied {
        if update.name == self.local.name {
            return self.about_self(update, now_ms);
        }
        let accept = match self.peers.get(&update.name) {
            None => true,
            Some(current) => gossip_overrides(update, current),
        };
        self.accept(update, accept, now_ms)
    }

    /// Merge one entry of a remote peer's full state.
    pub fn merge_remote(&mut self, update: &PeerUpdate, now_ms: u64) -> Applied {
        if update.name == self.local.name {
            return self.about_self(update, now_ms);
        }
        let accept = match self.peers.get(&update.name) {
            None => true,
            Some(current) => remote_overrides(update, current),
        };
        self.accept(update, accept, now_ms)
    }

    /// Move this node to `state` under a fresh incarnation (used by leave).
    pub fn bump_local(&mut self, state: PeerState, now_ms: u64) -> PeerUpdate {
        self.local.incarnation += 1;
        self.local.state = state;
        self.local.state_changed_at = now_ms;
        self.local.to_update()
    }

    fn accept(&mut self, update: &PeerUpdate, accept: bool, now_ms: u64) -> Applied {
        if !accept {
            return Applied::Ignored;
        }
        let previous = self.peers.get(&update.name).map(|m| m.state);
        let changed_at = match previous {
            Some(state) if state == update.state => self.peers[&update.name].state_changed_at,
            _ => now_ms,
        };
        self.peers.insert(
            update.name.clone(),
            Member {
                name: update.name.clone(),
                addr: update.addr,
                incarnation: update.incarnation,
                state: update.state,
                state_changed_at: changed_at,
            },
        );
        Applied::Changed {
            update: update.clone(),
            previous,
        }
    }

    fn about_self(&mut self, update: &PeerUpdate, now_ms: u64) -> Applied {
        // A leaving node does not argue with rumours about itself.
        if self.local.state == PeerState::Left {
            return Applied::Ignored;
        }
        let stale = match update.state {
            PeerState::Alive => update.incarnation <= self.local.incarnation,
            _ => update.incarnation < self.local.incarnation,
        };
        if stale {
            return Applied::Ignored;
        }
        self.local.incarnation = update.incarnation + 1;
        if self.local.state != PeerState::Alive {
            self.local.state = PeerState::Alive;
            self.local.state_changed_at = now_ms;
        }
        Applied::Refuted(self.local.to_update())
    }
}

/// SWIM precedence for gossip events.
fn gossip_overrides(new: &PeerUpdate, current: &Member) -> bool {
    use PeerState::*;
    match (new.state, current.state) {
        (Alive, _) => new.incarnation > current.incarnation,
        (Suspect, Alive) => new.incarnation >= current.incarnation,
        (Suspect, _) => new.incarnation > current.incarnation,
        (Dead | Left, Alive | Suspect) => new.incarnation >= current.incarnation,
        (Dead | Left, Dead | Left) => new.incarnation > current.incarnation,
    }
}

/// Anti-entropy precedence for push-pull state.
fn remote_overrides(new: &PeerUpdate, current: &Member) -> bool {
    if new.incarnation != current.incarnation {
        return new.incarnation > current.incarnation;
    }
    if current.state.is_terminal() {
        return false;
    }
    matches!(
        (new.state, current.state),
        (PeerState::Alive, PeerState::Suspect) | (PeerState::Left, _)
    )
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn update(name: &str, incarnation: u64, state: PeerState) -> PeerUpdate {
        PeerUpdate {
            name: name.to_string(),
            addr: addr(7000),
            incarnation,
            state,
        }
    }

    fn table_with(name: &str, incarnation: u64, state: PeerState) -> MemberTable {
        let mut table = MemberTable::new("local", addr(7946), 0);
        table.apply_gossip(&update(name, incarnation, state), 0);
        table
    }

    fn state_of(table: &MemberTable, name: &str) -> (u64, PeerState) {
        let m = table.get(name).unwrap();
        (m.incarnation, m.state)
    }

    #[test]
    fn unknown_peer_is_inserted() {
        let mut table = MemberTable::new("local", addr(7946), 0);
        let applied = table.apply_gossip(&update("a", 3, PeerState::Alive), 10);
        assert_eq!(
            applied,
            Applied::Changed {
                update: update("a", 3, PeerState::Alive),
                previous: None
            }
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a").unwrap().state_changed_at, 10);
    }

    #[test]
    fn gossip_alive_needs_higher_incarnation() {
        let mut table = table_with("a", 2, PeerState::Suspect);
        assert_eq!(
            table.apply_gossip(&update("a", 2, PeerState::Alive), 0),
            Applied::Ignored
        );
        assert!(matches!(
            table.apply_gossip(&update("a", 3, PeerState::Alive), 0),
            Applied::Changed { .. }
        ));
        assert_eq!(state_of(&table, "a"), (3, PeerState::Alive));
    }

    #[test]
    fn gossip_suspect_rules() {
        let mut table = table_with("a", 2, PeerState::Alive);
        table.apply_gossip(&update("a", 2, PeerState::Suspect), 0);
        assert_eq!(state_of(&table, "a"), (2, PeerState::Suspect));

        // Suspect over Suspect requires a higher incarnation.
        assert_eq!(
            table.apply_gossip(&update("a", 2, PeerState::Suspect), 0),
            Applied::Ignored
        );
        // Stale suspicion does not override.
        let mut table = table_with("a", 5, PeerState::Alive);
        assert_eq!(
            table.apply_gossip(&update("a", 4, PeerState::Suspect), 0),
            Applied::Ignored
        );
    }

    #[test]
    fn gossip_dead_and_left_are_sticky() {
        let mut table = table_with("a", 2, PeerState::Suspect);
        table.apply_gossip(&update("a", 2, PeerState::Dead), 0);
        assert_eq!(state_of(&table, "a"), (2, PeerState::Dead));

        for state in [PeerState::Alive, PeerState::Suspect, PeerState::Left] {
            assert_eq!(table.apply_gossip(&update("a", 2, state), 0), Applied::Ignored);
        }
        // A restarted peer comes back with a higher incarnation.
        table.apply_gossip(&update("a", 3, PeerState::Alive), 0);
        assert_eq!(state_of(&table, "a"), (3, PeerState::Alive));
    }

    #[test]
    fn push_pull_prefers_higher_incarnation() {
        let mut table = table_with("a", 4, PeerState::Alive);
        table.merge_remote(&update("a", 5, PeerState::Dead), 0);
        assert_eq!(state_of(&table, "a"), (5, PeerState::Dead));
        assert_eq!(
            table.merge_remote(&update("a", 4, PeerState::Alive), 0),
            Applied::Ignored
        );
    }

    #[test]
    fn push_pull_equal_incarnation_prefers_alive() {
        let mut table = table_with("a", 4, PeerState::Suspect);
        table.merge_remote(&update("a", 4, PeerState::Alive), 0);
        assert_eq!(state_of(&table, "a"), (4, PeerState::Alive));

        // Equal-incarnation suspicion or death is left to the local detector.
        assert_eq!(
            table.merge_remote(&update("a", 4, PeerState::Suspect), 0),
            Applied::Ignored
        );
        assert_eq!(
            table.merge_remote(&update("a", 4, PeerState::Dead), 0),
            Applied::Ignored
        );

        // Left is authoritative: only the peer itself announces it.
        table.merge_remote(&update("a", 4, PeerState::Left), 0);
        assert_eq!(state_of(&table, "a"), (4, PeerState::Left));
        assert_eq!(
            table.merge_remote(&update("a", 4, PeerState::Alive), 0),
            Applied::Ignored
        );
    }

    #[test]
    fn suspicion_of_self_is_refuted() {
        let mut table = MemberTable::new("local", addr(7946), 0);
        let applied = table.apply_gossip(&update("local", 0, PeerState::Suspect), 0);
        match applied {
            Applied::Refuted(u) => {
                assert_eq!(u.incarnation, 1);
                assert_eq!(u.state, PeerState::Alive);
            }
            other => panic!("expected refutation, got {other:?}"),
        }
        assert_eq!(table.local().incarnation, 1);

        // Stale rumours are ignored.
        assert_eq!(
            table.apply_gossip(&update("local", 0, PeerState::Dead), 0),
            Applied::Ignored
        );
        // Rumours from a previous life are outrun.
        assert!(matches!(
            table.merge_remote(&update("local", 7, PeerState::Dead), 0),
            Applied::Refuted(PeerUpdate { incarnation: 8, .. })
        ));
    }

    #[test]
    fn leaving_node_does_not_refute() {
        let mut table = MemberTable::new("local", addr(7946), 0);
        let left = table.bump_local(PeerState::Left, 5);
        assert_eq!(left.incarnation, 1);
        assert_eq!(left.state, PeerState::Left);
        assert_eq!(
            table.apply_gossip(&update("local", 1, PeerState::Dead), 0),
            Applied::Ignored
        );
        assert_eq!(table.local().state, PeerState::Left);
    }

    #[test]
    fn incarnation_never_decreases() {
        let mut rng = SmallRng::seed_from_u64(7);
        let states = [
            PeerState::Alive,
            PeerState::Suspect,
            PeerState::Dead,
            PeerState::Left,
        ];
        let mut table = MemberTable::new("local", addr(7946), 0);
        let mut seen: BTreeMap<String, u64> = BTreeMap::new();

        for step in 0..5_000u64 {
            let name = ["local", "a", "b", "c"][rng.random_range(0..4)];
            let u = update(
                name,
                rng.random_range(0..20),
                states[rng.random_range(0..states.len())],
            );
            if rng.random_bool(0.5) {
                table.apply_gossip(&u, step);
            } else {
                table.merge_remote(&u, step);
            }
            for m in table.view().members() {
                let floor = seen.entry(m.name.clone()).or_insert(0);
                assert!(m.incarnation >= *floor, "{} went backwards", m.name);
                *floor = m.incarnation;
            }
        }
    }
}
