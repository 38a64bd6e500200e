//! SWIM failure detector.
//!
//! Four loops share one [`Detector`]:
//!
//! ```text
//! inbound    packets and push-pull requests from the transport
//! probe      every probe interval: ping one peer (round-robin over a
//!            shuffled list), fall back to indirect pings through k relays,
//!            mark Suspect on silence; expire suspicions into Dead
//! gossip     every gossip interval: send queued events to a few peers
//! push-pull  every push-pull interval: full state exchange with one peer
//! ```
//!
//! Membership state lives behind a single mutex that is never held across
//! an await; readers get snapshots through a `watch` channel.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::{IndexedRandom, SliceRandom};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastQueue, History};
use crate::config::{BROADCAST_QUEUE_CAPACITY, HISTORY_CAPACITY, MAX_PIGGYBACK, PeerConfig};
use crate::error::ClusterResult;
use crate::member::{Member, MembershipView, PeerState, PeerUpdate};
use crate::message::{Body, Envelope, PushPull};
use crate::table::{Applied, MemberTable};
use crate::transport::{Inbound, Transport};

/// Which precedence rules an incoming batch of updates follows.
#[derive(Debug, Clone, Copy)]
enum Merge {
    Gossip,
    PushPull,
}

struct State {
    table: MemberTable,
    queue: BroadcastQueue,
    history: History,
    /// When each currently suspected peer was first suspected.
    suspicions: HashMap<String, Instant>,
    probe_order: VecDeque<String>,
}

pub(crate) struct Detector {
    config: PeerConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    seq: AtomicU64,
    view: watch::Sender<MembershipView>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Detector {
    pub(crate) fn new(config: PeerConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let table = MemberTable::new(&config.name, transport.local_addr(), now_ms());
        let (view, _) = watch::channel(table.view());
        Arc::new(Self {
            config,
            transport,
            state: Mutex::new(State {
                table,
                queue: BroadcastQueue::new(BROADCAST_QUEUE_CAPACITY),
                history: History::new(HISTORY_CAPACITY),
                suspicions: HashMap::new(),
                probe_order: VecDeque::new(),
            }),
            acks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            view,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_acks(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.view.subscribe()
    }

    pub(crate) fn view(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn publish(&self, state: &State) {
        let next = state.table.view();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    // ── Applying updates ───────────────────────────────────────────

    fn apply(&self, updates: impl IntoIterator<Item = PeerUpdate>, merge: Merge) {
        let now = now_ms();
        let mut state = self.lock();
        let mut changed = false;

        for update in updates {
            let applied = match merge {
                Merge::Gossip => state.table.apply_gossip(&update, now),
                Merge::PushPull => state.table.merge_remote(&update, now),
            };
            match applied {
                Applied::Ignored => {}
                Applied::Changed { update, previous } => {
                    changed = true;
                    if previous != Some(update.state) {
                        info!(
                            peer = %update.name,
                            addr = %update.addr,
                            from = ?previous,
                            to = %update.state,
                            incarnation = update.incarnation,
                            "peer state changed"
                        );
                    }
                    if update.state == PeerState::Suspect {
                        state
                            .suspicions
                            .entry(update.name.clone())
                            .or_insert_with(Instant::now);
                    } else {
                        state.suspicions.remove(&update.name);
                    }
                    state.history.record(update.clone());
                    state.queue.push(update);
                }
                Applied::Refuted(update) => {
                    changed = true;
                    warn!(
                        incarnation = update.incarnation,
                        "refuting rumour about this node"
                    );
                    state.history.record(update.clone());
                    state.queue.push(update);
                }
            }
        }

        if changed {
            self.publish(&state);
        }
    }

    // ── Sending ────────────────────────────────────────────────────

    /// Build an envelope carrying this node's state and queued events.
    fn envelope(&self, body: Body) -> Envelope {
        let mut state = self.lock();
        let limit = self.config.retransmit_limit(state.table.len());
        let events = state.queue.take(MAX_PIGGYBACK, limit);
        Envelope {
            sender: state.table.local().to_update(),
            body,
            events,
        }
    }

    async fn send(&self, to: SocketAddr, body: Body) {
        let envelope = self.envelope(body);
        if let Err(e) = self.transport.send(to, &envelope).await {
            debug!(%to, error = %e, "packet send failed");
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn expect_ack(&self) -> (u64, oneshot::Receiver<()>) {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.lock_acks().insert(seq, tx);
        (seq, rx)
    }

    // ── Inbound ────────────────────────────────────────────────────

    async fn handle(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Packet { from, envelope } => self.handle_packet(from, envelope).await,
            Inbound::PushPull { request, reply } => {
                let response = self.local_state(request.replay);
                self.apply_push_pull(request);
                let _ = reply.send(response);
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, from: SocketAddr, envelope: Envelope) {
        let Envelope {
            sender,
            body,
            events,
        } = envelope;
        let reply_to = sender.addr;
        self.apply(std::iter::once(sender).chain(events), Merge::Gossip);

        match body {
            Body::Ping { seq } => self.send(reply_to, Body::Ack { seq }).await,
            Body::Ack { seq } => {
                let waiter = self.lock_acks().remove(&seq);
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }
            Body::IndirectPing {
                seq,
                target,
                target_addr,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    if this.ping(target_addr).await {
                        this.send(reply_to, Body::Ack { seq }).await;
                    } else {
                        debug!(%target, requester = %from, "relayed probe unanswered");
                    }
                });
            }
            Body::Gossip => {}
        }
    }

    // ── Probing ────────────────────────────────────────────────────

    /// Direct ping; true if acknowledged within the probe timeout.
    async fn ping(&self, addr: SocketAddr) -> bool {
        let (seq, rx) = self.expect_ack();
        self.send(addr, Body::Ping { seq }).await;
        let acked = matches!(
            tokio::time::timeout(self.config.probe_timeout, rx).await,
            Ok(Ok(()))
        );
        self.lock_acks().remove(&seq);
        acked
    }

    async fn probe(&self, target: Member) {
        let (seq, mut rx) = self.expect_ack();
        self.send(target.addr, Body::Ping { seq }).await;
        let timeout = self.config.probe_timeout;
        if let Ok(Ok(())) = tokio::time::timeout(timeout, &mut rx).await {
            return;
        }

        let relays = self.pick(self.config.indirect_checks, |m| {
            m.state == PeerState::Alive && m.name != target.name
        });
        for relay in &relays {
            let body = Body::IndirectPing {
                seq,
                target: target.name.clone(),
                target_addr: target.addr,
            };
            self.send(relay.addr, body).await;
        }
        let acked = !relays.is_empty()
            && matches!(tokio::time::timeout(timeout, &mut rx).await, Ok(Ok(())));
        self.lock_acks().remove(&seq);

        if !acked {
            debug!(peer = %target.name, relays = relays.len(), "probe unanswered");
            self.apply(
                [PeerUpdate {
                    state: PeerState::Suspect,
                    ..target.to_update()
                }],
                Merge::Gossip,
            );
        }
    }

    fn next_probe_target(&self) -> Option<Member> {
        let mut state = self.lock();
        let state = &mut *state;
        for refilled in [false, true] {
            while let Some(name) = state.probe_order.pop_front() {
                if let Some(member) = state.table.get(&name)
                    && !member.state.is_terminal()
                    && name != state.table.local().name
                {
                    return Some(member.clone());
                }
            }
            if refilled {
                break;
            }
            let mut names: Vec<String> = state
                .table
                .peers()
                .filter(|m| !m.state.is_terminal())
                .map(|m| m.name.clone())
                .collect();
            names.shuffle(&mut rand::rng());
            state.probe_order = names.into();
        }
        None
    }

    /// Expire suspicions older than the suspicion timeout into Dead.
    fn expire_suspicions(&self) {
        let dead: Vec<PeerUpdate> = {
            let state = self.lock();
            let timeout = self.config.suspicion_timeout(state.table.len());
            state
                .suspicions
                .iter()
                .filter(|(_, since)| since.elapsed() >= timeout)
                .filter_map(|(name, _)| state.table.get(name))
                .filter(|m| m.state == PeerState::Suspect)
                .map(|m| PeerUpdate {
                    state: PeerState::Dead,
                    ..m.to_update()
                })
                .collect()
        };
        if !dead.is_empty() {
            self.apply(dead, Merge::Gossip);
        }
    }

    /// Up to `k` random peers matching `filter`.
    fn pick(&self, k: usize, filter: impl Fn(&Member) -> bool) -> Vec<Member> {
        let state = self.lock();
        let candidates: Vec<&Member> = state.table.peers().filter(|m| filter(m)).collect();
        candidates
            .choose_multiple(&mut rand::rng(), k)
            .map(|m| (*m).clone())
            .collect()
    }

    // ── Gossip and anti-entropy ────────────────────────────────────

    async fn gossip(&self) {
        let idle = self.lock().queue.is_empty();
        if idle {
            return;
        }
        // Dead peers are included so a healed partition hears refutations.
        let targets = self.pick(self.config.gossip_nodes, |m| m.state != PeerState::Left);
        for target in targets {
            self.send(target.addr, Body::Gossip).await;
        }
    }

    fn local_state(&self, with_history: bool) -> PushPull {
        let state = self.lock();
        PushPull {
            sender: state.table.local().to_update(),
            members: state.table.updates(),
            replay: false,
            history: if with_history {
                state.history.snapshot()
            } else {
                Vec::new()
            },
        }
    }

    fn apply_push_pull(&self, remote: PushPull) {
        if !remote.history.is_empty() {
            self.apply(remote.history, Merge::Gossip);
        }
        self.apply(
            std::iter::once(remote.sender).chain(remote.members),
            Merge::PushPull,
        );
    }

    /// Full state exchange with `addr`. Returns the number of members the
    /// remote reported.
    pub(crate) async fn exchange(&self, addr: SocketAddr, replay: bool) -> ClusterResult<usize> {
        let mut request = self.local_state(false);
        request.replay = replay;
        let response = self
            .transport
            .push_pull(addr, &request, self.config.tcp_timeout)
            .await?;
        let count = response.members.len();
        self.apply_push_pull(response);
        Ok(count)
    }

    async fn push_pull(&self) {
        let Some(target) = self.pick(1, |m| m.state != PeerState::Left).pop() else {
            return;
        };
        if let Err(e) = self.exchange(target.addr, false).await {
            debug!(peer = %target.name, error = %e, "push-pull failed");
        }
    }

    // ── Leave ──────────────────────────────────────────────────────

    /// Announce Left under a fresh incarnation and wait up to the leave
    /// timeout for any live peer to acknowledge it.
    pub(crate) async fn leave(&self) -> bool {
        let targets = {
            let mut state = self.lock();
            let update = state.table.bump_local(PeerState::Left, now_ms());
            info!(incarnation = update.incarnation, "leaving cluster");
            state.history.record(update.clone());
            state.queue.push(update);
            self.publish(&state);
            state
                .table
                .peers()
                .filter(|m| m.state == PeerState::Alive)
                .map(|m| m.addr)
                .collect::<Vec<_>>()
        };
        if targets.is_empty() {
            return true;
        }

        let (seq, rx) = self.expect_ack();
        for addr in targets {
            self.send(addr, Body::Ping { seq }).await;
        }
        let acked = matches!(
            tokio::time::timeout(self.config.leave_timeout, rx).await,
            Ok(Ok(()))
        );
        self.lock_acks().remove(&seq);
        acked
    }

    // ── Loops ──────────────────────────────────────────────────────

    pub(crate) fn spawn(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(4);

        let this = self.clone();
        let mut stop = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = inbound.recv() => match msg {
                        Some(msg) => this.handle(msg).await,
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
            debug!("inbound loop stopped");
        }));

        let this = self.clone();
        tasks.push(every(self.config.probe_interval, shutdown.clone(), move || {
            let this = this.clone();
            async move {
                if let Some(target) = this.next_probe_target() {
                    this.probe(target).await;
                }
                this.expire_suspicions();
            }
        }));

        let this = self.clone();
        tasks.push(every(self.config.gossip_interval, shutdown.clone(), move || {
            let this = this.clone();
            async move { this.gossip().await }
        }));

        let this = self.clone();
        tasks.push(every(self.config.push_pull_interval, shutdown, move || {
            let this = this.clone();
            async move { this.push_pull().await }
        }));

        tasks
    }
}

/// Run `tick` on a fixed period until shutdown.
fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}
