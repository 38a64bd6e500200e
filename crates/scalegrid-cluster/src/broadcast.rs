//! Outbound event buffers: the retransmit queue piggybacked on packets and
//! the recent-event history replayed to joining peers.

use std::collections::VecDeque;

use crate::member::PeerUpdate;

struct Queued {
    update: PeerUpdate,
    transmits: u32,
}

/// Bounded queue holding at most one pending update per peer.
pub struct BroadcastQueue {
    entries: Vec<Queued>,
    capacity: usize,
}

impl BroadcastQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an update, replacing any older update about the same peer.
    /// When full, the most-transmitted entry is evicted.
    pub fn push(&mut self, update: PeerUpdate) {
        self.entries.retain(|q| q.update.name != update.name);
        if self.entries.len() >= self.capacity
            && let Some(idx) = self
                .entries
                .iter()
                .enumerate()
                .max_by_key(|(_, q)| q.transmits)
                .map(|(idx, _)| idx)
        {
            self.entries.swap_remove(idx);
        }
        self.entries.push(Queued {
            update,
            transmits: 0,
        });
    }

    /// Take up to `max` updates, least-transmitted first. Entries that reach
    /// `limit` transmissions are dropped.
    pub fn take(&mut self, max: usize, limit: u32) -> Vec<PeerUpdate> {
        self.entries.sort_by_key(|q| q.transmits);
        let mut out = Vec::with_capacity(max.min(self.entries.len()));
        for queued in self.entries.iter_mut().take(max) {
            queued.transmits += 1;
            out.push(queued.update.clone());
        }
        self.entries.retain(|q| q.transmits < limit);
        out
    }
}

/// Ring buffer of the most recent membership events.
pub struct History {
    events: VecDeque<PeerUpdate>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, update: PeerUpdate) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(update);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<PeerUpdate> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::member::PeerState;

    fn update(name: &str, incarnation: u64) -> PeerUpdate {
        PeerUpdate {
            name: name.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], 7946)),
            incarnation,
            state: PeerState::Alive,
        }
    }

    #[test]
    fn newer_update_replaces_older() {
        let mut queue = BroadcastQueue::new(8);
        queue.push(update("a", 1));
        queue.push(update("a", 2));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(10, 4)[0].incarnation, 2);
    }

    #[test]
    fn entries_retire_after_limit() {
        let mut queue = BroadcastQueue::new(8);
        queue.push(update("a", 1));
        for _ in 0..3 {
            assert_eq!(queue.take(10, 3).len(), 1);
        }
        assert!(queue.is_empty());
        assert!(queue.take(10, 3).is_empty());
    }

    #[test]
    fn least_transmitted_go_first() {
        let mut queue = BroadcastQueue::new(8);
        queue.push(update("a", 1));
        queue.take(1, 10);
        queue.push(update("b", 1));
        let taken = queue.take(1, 10);
        assert_eq!(taken[0].name, "b");
    }

    #[test]
    fn full_queue_evicts_most_transmitted() {
        let mut queue = BroadcastQueue::new(2);
        queue.push(update("a", 1));
        queue.take(1, 10);
        queue.push(update("b", 1));
        queue.push(update("c", 1));
        assert_eq!(queue.len(), 2);
        let names: Vec<_> = queue.take(10, 10).into_iter().map(|u| u.name).collect();
        assert!(!names.contains(&"a".to_string()));
    }

    #[test]
    fn history_is_bounded() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.record(update("a", i));
        }
        let incarnations: Vec<_> = history.snapshot().iter().map(|u| u.incarnation).collect();
        assert_eq!(incarnations, vec![2, 3, 4]);
    }
}
