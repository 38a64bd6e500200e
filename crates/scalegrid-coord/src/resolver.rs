//! Ownership resolver — decides which policies this node runs.
//!
//! One task per node owns all lease bookkeeping. It reacts to:
//!
//! - the `policies/` watch (new, changed and deleted policies),
//! - the `locks/` watch (a deleted lock is an immediate chance to acquire),
//! - membership changes,
//! - a renew tick at a third of the lease TTL,
//! - a periodic resync that relists every policy.
//!
//! Workers are started and stopped through [`PolicyRunner`]. Each one gets
//! a [`watch::Receiver<Ownership>`] gate: `Unknown` pauses it while the store
//! is unreachable, `Lost` means it has been stopped for good. Every held
//! lease also has a local deadline, one ownership window after the last
//! confirmed renewal was sent; past it the gate drops to `Unknown` even if
//! the store never answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scalegrid_cluster::MembershipView;
use scalegrid_state::{EventKind, PolicyId, ScalingPolicy, WatchEvent, keys};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::{CoordinationAdapter, LeaseOutcome};
use crate::error::{CoordError, CoordResult};

/// Renewal failures tolerated before a policy is given up.
const MAX_RENEW_FAILURES: u32 = 2;

/// Pause after a failed watch call before polling again.
const WATCH_RETRY: Duration = Duration::from_millis(500);

/// This node's standing on one policy, as seen by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The lease was renewed recently; the worker may act.
    Owned,
    /// The store could not confirm the lease; the worker must not act.
    Unknown,
    /// The lease is gone; the worker has been stopped.
    Lost,
}

/// Starts and stops per-policy workers.
pub trait PolicyRunner: Send + Sync + 'static {
    /// Start a worker for `policy`. Replaces any worker already running
    /// for the same id.
    fn start(&self, policy: ScalingPolicy, ownership: watch::Receiver<Ownership>);

    /// Stop the worker for `policy_id`. An in-flight dispatch may finish;
    /// no new evaluation starts.
    fn stop(&self, policy_id: &str);
}

struct Held {
    gate: Arc<watch::Sender<Ownership>>,
    /// Dropping it stops the deadline task.
    deadline: watch::Sender<Instant>,
    failures: u32,
}

impl Held {
    fn new(policy_id: &str, deadline: Instant) -> Self {
        let gate = Arc::new(watch::channel(Ownership::Owned).0);
        let (deadline_tx, deadline_rx) = watch::channel(deadline);
        tokio::spawn(lapse_at_deadline(
            policy_id.to_string(),
            gate.clone(),
            deadline_rx,
        ));
        Self {
            gate,
            deadline: deadline_tx,
            failures: 0,
        }
    }

    /// A renewal sent before `deadline - window` succeeded.
    fn confirm(&mut self, deadline: Instant) {
        self.failures = 0;
        self.deadline.send_replace(deadline);
        self.gate.send_if_modified(|state| {
            let paused = *state == Ownership::Unknown;
            if paused {
                *state = Ownership::Owned;
            }
            paused
        });
    }
}

/// Move the gate from `Owned` to `Unknown` whenever the current deadline
/// passes. Exits once the deadline sender is dropped.
async fn lapse_at_deadline(
    policy_id: String,
    gate: Arc<watch::Sender<Ownership>>,
    mut deadline: watch::Receiver<Instant>,
) {
    loop {
        let until = *deadline.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep_until(until) => {
                let lapsed = gate.send_if_modified(|state| {
                    let due = *state == Ownership::Owned && Instant::now() >= *deadline.borrow();
                    if due {
                        *state = Ownership::Unknown;
                    }
                    due
                });
                if lapsed {
                    warn!(%policy_id, "lease not confirmed in time; pausing worker");
                }
                if deadline.changed().await.is_err() {
                    return;
                }
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

pub struct OwnershipResolver {
    adapter: Arc<CoordinationAdapter>,
    runner: Arc<dyn PolicyRunner>,
    membership: watch::Receiver<MembershipView>,
    resync_interval: Duration,
    policies: HashMap<PolicyId, ScalingPolicy>,
    held: HashMap<PolicyId, Held>,
}

impl OwnershipResolver {
    pub fn new(
        adapter: Arc<CoordinationAdapter>,
        runner: Arc<dyn PolicyRunner>,
        membership: watch::Receiver<MembershipView>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            adapter,
            runner,
            membership,
            resync_interval,
            policies: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// Policies this resolver currently runs, sorted.
    pub fn owned(&self) -> Vec<PolicyId> {
        let mut ids: Vec<PolicyId> = self.held.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn locally_alive(&self) -> bool {
        let view = self.membership.borrow();
        view.is_alive(view.local_name())
    }

    /// Drive the resolver until `shutdown` fires, then stop every worker
    /// and release every held lease.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut policy_watch = self.adapter.watch(keys::POLICIES);
        let mut lock_watch = self.adapter.watch(keys::LOCKS);
        let mut membership = self.membership.clone();
        let mut membership_open = true;

        let renew_every = self.adapter.config().renew_interval();
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync =
            tokio::time::interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(node = %self.adapter.node(), "ownership resolver started");
        loop {
            tokio::select! {
                event = policy_watch.next() => match event {
                    Ok(event) => self.on_policy_event(event).await,
                    Err(e) => {
                        warn!(error = %e, "policy watch failed");
                        tokio::time::sleep(WATCH_RETRY).await;
                    }
                },
                event = lock_watch.next() => match event {
                    Ok(event) => self.on_lock_event(event).await,
                    Err(e) => {
                        warn!(error = %e, "lock watch failed");
                        tokio::time::sleep(WATCH_RETRY).await;
                    }
                },
                changed = membership.changed(), if membership_open => {
                    if changed.is_err() {
                        membership_open = false;
                        continue;
                    }
                    self.acquire_unowned().await;
                }
                _ = renew.tick() => self.renew_all().await,
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "policy resync failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.release_all().await;
        info!(node = %self.adapter.node(), "ownership resolver stopped");
    }

    // ── Events ─────────────────────────────────────────────────────

    async fn on_policy_event(&mut self, event: WatchEvent) {
        let Some(id) = keys::id_of(keys::POLICIES, &event.key) else {
            return;
        };
        match (event.kind, event.value) {
            (EventKind::Put, Some(raw)) => match serde_json::from_str::<ScalingPolicy>(&raw) {
                Ok(policy) => self.on_policy_put(policy).await,
                Err(e) => warn!(key = %event.key, error = %e, "ignoring undecodable policy"),
            },
            (EventKind::Put, None) => {}
            (EventKind::Delete, _) => {
                let id = id.to_string();
                self.on_policy_deleted(&id).await;
            }
        }
    }

    async fn on_lock_event(&mut self, event: WatchEvent) {
        let Some(id) = keys::id_of(keys::LOCKS, &event.key) else {
            return;
        };
        let id = id.to_string();
        match event.kind {
            EventKind::Delete => {
                debug!(policy_id = %id, "lock released");
                if self.policies.contains_key(&id) {
                    self.try_acquire(&id).await;
                }
            }
            EventKind::Put => {
                // Our own lock can be replaced only after it expired.
                let ours = event.value.as_deref() == Some(self.adapter.node());
                if !ours && self.held.contains_key(&id) {
                    self.lose(&id, "lock taken over");
                }
            }
        }
    }

    /// Record a new or changed policy and start or restart its worker.
    pub async fn on_policy_put(&mut self, policy: ScalingPolicy) {
        if let Err(e) = policy.validate() {
            warn!(policy_id = %policy.id, error = %e, "ignoring invalid policy");
            return;
        }
        let id = policy.id.clone();
        let previous = self.policies.insert(id.clone(), policy.clone());
        if previous.as_ref() == Some(&policy) && self.held.contains_key(&id) {
            return;
        }

        if let Some(held) = self.held.get(&id) {
            info!(policy_id = %id, "policy changed; restarting worker");
            self.runner.stop(&id);
            self.runner.start(policy, held.gate.subscribe());
            return;
        }
        self.try_acquire(&id).await;
    }

    /// Forget a deleted policy, stopping its worker and releasing its lock.
    pub async fn on_policy_deleted(&mut self, policy_id: &str) {
        self.policies.remove(policy_id);
        if let Some(held) = self.held.remove(policy_id) {
            self.runner.stop(policy_id);
            held.gate.send_replace(Ownership::Lost);
            if let Err(e) = self.adapter.release_lease(policy_id).await {
                warn!(%policy_id, error = %e, "failed to release lease of deleted policy");
                self.adapter.forget(policy_id);
            }
            info!(%policy_id, "policy deleted; worker stopped");
        }
    }

    // ── Ownership ──────────────────────────────────────────────────

    /// Attempt to take ownership of a known policy.
    pub async fn try_acquire(&mut self, policy_id: &str) {
        if self.held.contains_key(policy_id) || !self.locally_alive() {
            return;
        }
        let Some(policy) = self.policies.get(policy_id).cloned() else {
            return;
        };
        let sent = Instant::now();
        match self.adapter.acquire_lease(policy_id).await {
            Ok(LeaseOutcome::Granted) => {
                let deadline = sent + self.adapter.config().ownership_window();
                let held = Held::new(policy_id, deadline);
                self.runner.start(policy, held.gate.subscribe());
                self.held.insert(policy_id.to_string(), held);
                info!(%policy_id, node = %self.adapter.node(), "ownership acquired");
            }
            Ok(LeaseOutcome::AlreadyHeld { holder }) => {
                debug!(%policy_id, %holder, "policy owned elsewhere");
            }
            Err(e) => warn!(%policy_id, error = %e, "lease acquisition failed"),
        }
    }

    async fn acquire_unowned(&mut self) {
        let mut unowned: Vec<PolicyId> = self
            .policies
            .keys()
            .filter(|id| !self.held.contains_key(*id))
            .cloned()
            .collect();
        unowned.sort();
        for id in unowned {
            self.try_acquire(&id).await;
        }
    }

    /// Renew every held lease concurrently, so one round takes at most a
    /// single store call timeout. One transient failure pauses the worker;
    /// a second in a row, or a definite loss, stops it.
    pub async fn renew_all(&mut self) {
        let sent = Instant::now();
        let mut renewals = JoinSet::new();
        for id in self.held.keys().cloned() {
            let adapter = self.adapter.clone();
            renewals.spawn(async move {
                let result = adapter.renew_lease(&id).await;
                (id, result)
            });
        }
        let mut results: Vec<(PolicyId, Result<(), CoordError>)> = Vec::new();
        while let Some(joined) = renewals.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "lease renewal task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let deadline = sent + self.adapter.config().ownership_window();
        for (id, result) in results {
            let Some(held) = self.held.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(()) => held.confirm(deadline),
                Err(e) if e.is_ownership_lost() => self.lose(&id, "lease expired"),
                Err(e) => {
                    held.failures += 1;
                    if held.failures >= MAX_RENEW_FAILURES {
                        warn!(policy_id = %id, error = %e, "lease renewal failed repeatedly");
                        self.lose(&id, "renewal failed");
                    } else {
                        warn!(policy_id = %id, error = %e, "lease renewal failed; pausing worker");
                        held.gate.send_replace(Ownership::Unknown);
                    }
                }
            }
        }
    }

    fn lose(&mut self, policy_id: &str, reason: &str) {
        let Some(held) = self.held.remove(policy_id) else {
            return;
        };
        self.runner.stop(policy_id);
        held.gate.send_replace(Ownership::Lost);
        self.adapter.forget(policy_id);
        warn!(%policy_id, reason, "ownership lost");
    }

    /// Relist every policy and reconcile against what is known.
    pub async fn resync(&mut self) -> CoordResult<()> {
        let policies = self.adapter.load_policies().await?;
        let listed: HashMap<PolicyId, ScalingPolicy> =
            policies.into_iter().map(|p| (p.id.clone(), p)).collect();

        let vanished: Vec<PolicyId> = self
            .policies
            .keys()
            .filter(|id| !listed.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            self.on_policy_deleted(&id).await;
        }
        for policy in listed.into_values() {
            self.on_policy_put(policy).await;
        }
        Ok(())
    }

    /// Stop every worker and release every held lease.
    pub async fn release_all(&mut self) {
        let ids: Vec<PolicyId> = self.held.keys().cloned().collect();
        for id in &ids {
            self.runner.stop(id);
        }
        for id in ids {
            if let Some(held) = self.held.remove(&id) {
                held.gate.send_replace(Ownership::Lost);
            }
            if let Err(e) = self.adapter.release_lease(&id).await {
                warn!(policy_id = %id, error = %e, "failed to release lease; it will expire");
                self.adapter.forget(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use scalegrid_cluster::{Member, PeerState};
    use scalegrid_state::{
        EventBatch, KvStore, LeaseId, ManualClock, PrefixSnapshot, RecordStore, StateError,
        StateResult, StateStore,
    };

    use super::*;
    use crate::adapter::CoordConfig;

    /// Records which workers are running.
    #[derive(Default)]
    struct FakeRunner {
        running: Mutex<BTreeMap<PolicyId, watch::Receiver<Ownership>>>,
        starts: Mutex<Vec<PolicyId>>,
    }

    impl FakeRunner {
        fn running(&self) -> Vec<PolicyId> {
            self.running.lock().unwrap().keys().cloned().collect()
        }

        fn gate(&self, id: &str) -> Ownership {
            *self.running.lock().unwrap()[id].borrow()
        }

        fn starts(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    impl PolicyRunner for FakeRunner {
        fn start(&self, policy: ScalingPolicy, ownership: watch::Receiver<Ownership>) {
            self.starts.lock().unwrap().push(policy.id.clone());
            self.running.lock().unwrap().insert(policy.id, ownership);
        }

        fn stop(&self, policy_id: &str) {
            self.running.lock().unwrap().remove(policy_id);
        }
    }

    /// A store that can be switched off.
    struct FlakyStore {
        inner: StateStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> StateResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StateError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> StateResult<Option<String>> {
            self.check()?;
            self.inner.get(key)
        }
        async fn put(&self, key: &str, value: &str) -> StateResult<u64> {
            self.check()?;
            self.inner.put(key, value)
        }
        async fn delete(&self, key: &str) -> StateResult<bool> {
            self.check()?;
            self.inner.delete(key)
        }
        async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
            self.check()?;
            self.inner.list_prefix(prefix)
        }
        async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
            self.check()?;
            self.inner.grant_lease(ttl)
        }
        async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
            self.check()?;
            self.inner.keep_alive(lease)
        }
        async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
            self.check()?;
            self.inner.revoke_lease(lease)
        }
        async fn put_if_absent(
            &self,
            key: &str,
            value: &str,
            lease: Option<LeaseId>,
        ) -> StateResult<Option<String>> {
            self.check()?;
            self.inner.put_if_absent(key, value, lease)
        }
        async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
            self.check()?;
            self.inner.delete_if_equals(key, expected)
        }
        async fn put_if_equals(
            &self,
            guard_key: &str,
            expected: &str,
            key: &str,
            value: &str,
        ) -> StateResult<bool> {
            self.check()?;
            self.inner.put_if_equals(guard_key, expected, key, value)
        }
        async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
            self.check()?;
            self.inner.wait_events(revision, wait).await
        }
    }

    /// A store whose calls never return once `hang` is set.
    struct HangingStore {
        inner: StateStore,
        hang: AtomicBool,
    }

    impl HangingStore {
        async fn stall(&self) {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl KvStore for HangingStore {
        async fn get(&self, key: &str) -> StateResult<Option<String>> {
            self.stall().await;
            self.inner.get(key)
        }
        async fn put(&self, key: &str, value: &str) -> StateResult<u64> {
            self.stall().await;
            self.inner.put(key, value)
        }
        async fn delete(&self, key: &str) -> StateResult<bool> {
            self.stall().await;
            self.inner.delete(key)
        }
        async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
            self.stall().await;
            self.inner.list_prefix(prefix)
        }
        async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
            self.stall().await;
            self.inner.grant_lease(ttl)
        }
        async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
            self.stall().await;
            self.inner.keep_alive(lease)
        }
        async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
            self.stall().await;
            self.inner.revoke_lease(lease)
        }
        async fn put_if_absent(
            &self,
            key: &str,
            value: &str,
            lease: Option<LeaseId>,
        ) -> StateResult<Option<String>> {
            self.stall().await;
            self.inner.put_if_absent(key, value, lease)
        }
        async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
            self.stall().await;
            self.inner.delete_if_equals(key, expected)
        }
        async fn put_if_equals(
            &self,
            guard_key: &str,
            expected: &str,
            key: &str,
            value: &str,
        ) -> StateResult<bool> {
            self.stall().await;
            self.inner.put_if_equals(guard_key, expected, key, value)
        }
        async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
            self.stall().await;
            self.inner.wait_events(revision, wait).await
        }
    }

    const TTL: Duration = Duration::from_secs(15);

    fn policy(id: &str) -> ScalingPolicy {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "fleet": "web",
            "query": "avg(cpu)",
            "scale_out": {"threshold": 80.0, "magnitude": 1},
            "scale_in": null,
            "cooldown": "5m",
            "action": {"url": "http://actions/scale"}
        }))
        .unwrap()
    }

    fn alive_view(local: &str) -> MembershipView {
        view_with(local, PeerState::Alive)
    }

    fn view_with(local: &str, state: PeerState) -> MembershipView {
        let member = Member {
            name: local.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], 8601)),
            incarnation: 0,
            state,
            state_changed_at: 0,
        };
        MembershipView::new(local, [member])
    }

    struct Node {
        resolver: OwnershipResolver,
        runner: Arc<FakeRunner>,
        membership: watch::Sender<MembershipView>,
    }

    fn node(store: Arc<dyn KvStore>, name: &str) -> Node {
        let adapter = Arc::new(CoordinationAdapter::new(store, name, CoordConfig::default()));
        let runner = Arc::new(FakeRunner::default());
        let (membership, view) = watch::channel(alive_view(name));
        let resolver = OwnershipResolver::new(
            adapter,
            runner.clone(),
            view,
            Duration::from_secs(30),
        );
        Node {
            resolver,
            runner,
            membership,
        }
    }

    fn store_with_clock() -> (StateStore, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn exactly_one_node_runs_each_policy() {
        let (store, _) = store_with_clock();
        let shared: Arc<dyn KvStore> = Arc::new(store);
        for id in ["p1", "p2", "p3"] {
            shared.put_policy(&policy(id)).await.unwrap();
        }

        let mut nodes: Vec<Node> = ["node-a", "node-b", "node-c"]
            .into_iter()
            .map(|n| node(shared.clone(), n))
            .collect();
        for node in nodes.iter_mut() {
            node.resolver.resync().await.unwrap();
        }

        for id in ["p1", "p2", "p3"] {
            let runners = nodes
                .iter()
                .filter(|n| n.runner.running().contains(&id.to_string()))
                .count();
            assert_eq!(runners, 1, "{id} must run on exactly one node");
        }
        // The first node to resync takes everything that was free.
        assert_eq!(nodes[0].resolver.owned(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn crashed_owner_is_replaced_after_ttl() {
        let (store, clock) = store_with_clock();
        let shared: Arc<dyn KvStore> = Arc::new(store);
        shared.put_policy(&policy("p1")).await.unwrap();

        let mut a = node(shared.clone(), "node-a");
        let mut b = node(shared.clone(), "node-b");
        a.resolver.resync().await.unwrap();
        b.resolver.resync().await.unwrap();
        assert_eq!(a.runner.running(), vec!["p1"]);
        assert!(b.runner.running().is_empty());

        // node-a stops renewing; before the TTL nothing changes.
        clock.advance(TTL / 2);
        b.resolver.resync().await.unwrap();
        assert!(b.runner.running().is_empty());

        clock.advance(TTL);
        b.resolver.resync().await.unwrap();
        assert_eq!(b.runner.running(), vec!["p1"]);

        // node-a wakes up and learns it lost the lease.
        a.resolver.renew_all().await;
        assert!(a.runner.running().is_empty());
        assert!(a.resolver.owned().is_empty());
    }

    #[tokio::test]
    async fn store_outage_pauses_then_stops_the_worker() {
        let (inner, clock) = store_with_clock();
        let flaky = Arc::new(FlakyStore {
            inner,
            down: AtomicBool::new(false),
        });
        flaky.put_policy(&policy("p1")).await.unwrap();

        let mut a = node(flaky.clone(), "node-a");
        a.resolver.resync().await.unwrap();
        let gate = a.runner.running.lock().unwrap()["p1"].clone();
        assert_eq!(*gate.borrow(), Ownership::Owned);

        flaky.down.store(true, Ordering::SeqCst);
        a.resolver.renew_all().await;
        assert_eq!(a.runner.gate("p1"), Ownership::Unknown);

        // Recovery restores the gate.
        flaky.down.store(false, Ordering::SeqCst);
        a.resolver.renew_all().await;
        assert_eq!(a.runner.gate("p1"), Ownership::Owned);

        flaky.down.store(true, Ordering::SeqCst);
        a.resolver.renew_all().await;
        a.resolver.renew_all().await;
        assert!(a.runner.running().is_empty());
        assert_eq!(*gate.borrow(), Ownership::Lost);

        // Once the store is back and the old lease has expired, the policy
        // is picked up again.
        flaky.down.store(false, Ordering::SeqCst);
        a.resolver.resync().await.unwrap();
        assert!(a.runner.running().is_empty());
        clock.advance(TTL + Duration::from_millis(1));
        a.resolver.resync().await.unwrap();
        assert_eq!(a.runner.running(), vec!["p1"]);
    }

    fn hanging_store() -> Arc<HangingStore> {
        let (inner, _) = store_with_clock();
        Arc::new(HangingStore {
            inner,
            hang: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn hung_store_pauses_every_worker_within_one_call_timeout() {
        let store = hanging_store();
        for id in ["p1", "p2", "p3"] {
            store.put_policy(&policy(id)).await.unwrap();
        }
        let mut a = node(store.clone(), "node-a");
        a.resolver.resync().await.unwrap();
        assert_eq!(a.runner.running(), vec!["p1", "p2", "p3"]);

        let confirmed = Instant::now();
        store.hang.store(true, Ordering::SeqCst);
        tokio::time::sleep(TTL / 3).await;
        a.resolver.renew_all().await;

        // The three renewals time out together, well inside the TTL.
        let config = CoordConfig::default();
        assert!(confirmed.elapsed() < TTL / 3 + 2 * config.call_timeout);
        assert!(confirmed.elapsed() < TTL);
        for id in ["p1", "p2", "p3"] {
            assert_eq!(a.runner.gate(id), Ownership::Unknown, "{id}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gate_lapses_at_the_local_deadline_without_a_store_reply() {
        let store = hanging_store();
        store.put_policy(&policy("p1")).await.unwrap();
        let mut a = node(store.clone(), "node-a");
        a.resolver.resync().await.unwrap();
        let window = CoordConfig::default().ownership_window();

        // A successful renewal moves the deadline out.
        tokio::time::sleep(TTL / 3).await;
        a.resolver.renew_all().await;
        tokio::time::sleep(window - TTL / 3 + Duration::from_secs(1)).await;
        assert_eq!(a.runner.gate("p1"), Ownership::Owned);

        // With the store silent and no renewal round at all, the gate
        // closes on its own one window after the last renewal was sent.
        store.hang.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(4) - Duration::from_millis(1)).await;
        assert_eq!(a.runner.gate("p1"), Ownership::Owned);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(a.runner.gate("p1"), Ownership::Unknown);
    }

    #[tokio::test]
    async fn non_alive_node_never_acquires() {
        let (store, _) = store_with_clock();
        let shared: Arc<dyn KvStore> = Arc::new(store);
        shared.put_policy(&policy("p1")).await.unwrap();

        let mut a = node(shared.clone(), "node-a");
        a.membership
            .send_replace(view_with("node-a", PeerState::Left));
        a.resolver.resync().await.unwrap();
        assert!(a.runner.running().is_empty());
        assert_eq!(shared.get("locks/p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn policy_change_restarts_and_delete_releases() {
        let (store, _) = store_with_clock();
        let shared: Arc<dyn KvStore> = Arc::new(store);
        let mut a = node(shared.clone(), "node-a");

        a.resolver.on_policy_put(policy("p1")).await;
        assert_eq!(a.runner.starts(), 1);
        // Storing the same policy again is a no-op.
        a.resolver.on_policy_put(policy("p1")).await;
        assert_eq!(a.runner.starts(), 1);

        let mut changed = policy("p1");
        changed.cooldown = "10m".into();
        a.resolver.on_policy_put(changed).await;
        assert_eq!(a.runner.starts(), 2);
        assert_eq!(a.runner.running(), vec!["p1"]);

        a.resolver.on_policy_deleted("p1").await;
        assert!(a.runner.running().is_empty());
        assert_eq!(shared.get("locks/p1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_acquires_and_releases_on_shutdown() {
        let (store, _) = store_with_clock();
        let shared: Arc<dyn KvStore> = Arc::new(store);
        let a = node(shared.clone(), "node-a");
        let runner = a.runner.clone();
        let _membership = a.membership;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(a.resolver.run(shutdown_rx));

        shared.put_policy(&policy("p1")).await.unwrap();
        for _ in 0..50 {
            if runner.running() == vec!["p1"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runner.running(), vec!["p1"]);
        assert_eq!(
            shared.get("locks/p1").await.unwrap().as_deref(),
            Some("node-a")
        );

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(runner.running().is_empty());
        assert_eq!(shared.get("locks/p1").await.unwrap(), None);
    }
}
