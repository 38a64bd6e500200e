//! Autoscale manager — one evaluation worker per owned policy.
//!
//! The manager spawns a background task per policy this node owns. Each
//! task runs `Idle → Evaluating → (NoAction | Cooling | Acting)` on the
//! policy's interval and persists the outcome as run state.
//!
//! Workers never decide ownership themselves: they are started and stopped
//! by the ownership resolver through [`PolicyRunner`], and they only act
//! while their ownership gate reads `Owned`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use scalegrid_coord::{CoordResult, CoordinationAdapter, Ownership, PolicyRunner};
use scalegrid_state::{
    ActionOutcome, ActionRecord, Clock, Direction, Phase, PolicyId, RunState, ScalingPolicy,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::action::{ActionExecutor, ActionRequest, action_id};
use crate::evaluator::{Decision, evaluate};
use crate::metrics::MetricSource;
use crate::silence::SilenceSet;

/// A running worker.
struct WorkerSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    /// Closes when the worker task ends.
    exited: watch::Receiver<()>,
}

/// A stopped worker that may still be finishing a dispatch.
struct Retired {
    policy_id: PolicyId,
    handle: JoinHandle<()>,
    exited: watch::Receiver<()>,
}

/// Runs evaluation workers for the policies this node owns.
pub struct AutoscaleManager {
    adapter: Arc<CoordinationAdapter>,
    metrics: Arc<dyn MetricSource>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
    /// Active workers: policy id → slot.
    workers: Mutex<HashMap<PolicyId, WorkerSlot>>,
    retired: Mutex<Vec<Retired>>,
}

impl AutoscaleManager {
    pub fn new(
        adapter: Arc<CoordinationAdapter>,
        metrics: Arc<dyn MetricSource>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            adapter,
            metrics,
            executor,
            clock,
            workers: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<PolicyId, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retired(&self) -> std::sync::MutexGuard<'_, Vec<Retired>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, policy_id: &str, slot: WorkerSlot) {
        let _ = slot.shutdown_tx.send(true);
        let mut retired = self.retired();
        retired.retain(|r| !r.handle.is_finished());
        retired.push(Retired {
            policy_id: policy_id.to_string(),
            handle: slot.handle,
            exited: slot.exited,
        });
    }

    /// Start evaluating `policy`, replacing any worker already running it.
    pub fn start_worker(&self, policy: ScalingPolicy, ownership: watch::Receiver<Ownership>) {
        let (interval, cooldown) = match (policy.interval_duration(), policy.cooldown_duration()) {
            (Ok(interval), Ok(cooldown)) => (interval, cooldown),
            (Err(e), _) | (_, Err(e)) => {
                warn!(policy_id = %policy.id, error = %e, "refusing to start worker");
                return;
            }
        };

        let policy_id = policy.id.clone();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (exited_tx, exited) = watch::channel(());
        let worker = PolicyWorker {
            policy,
            interval,
            cooldown,
            adapter: self.adapter.clone(),
            metrics: self.metrics.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            ownership,
            shutdown,
            state: None,
        };

        // The new worker starts its first cycle only after every earlier
        // worker for the same policy has exited.
        let mut workers = self.workers();
        if let Some(old) = workers.remove(&policy_id) {
            self.retire(&policy_id, old);
        }
        let previous: Vec<watch::Receiver<()>> = self
            .retired()
            .iter()
            .filter(|r| r.policy_id == policy_id && !r.handle.is_finished())
            .map(|r| r.exited.clone())
            .collect();
        let handle = tokio::spawn(worker.run(previous, exited_tx));
        workers.insert(
            policy_id.clone(),
            WorkerSlot {
                handle,
                shutdown_tx,
                exited,
            },
        );
        drop(workers);
        info!(%policy_id, ?interval, ?cooldown, "policy worker started");
    }

    /// Signal a worker to stop. A dispatch in progress runs to completion.
    pub fn stop_worker(&self, policy_id: &str) {
        let slot = self.workers().remove(policy_id);
        if let Some(slot) = slot {
            self.retire(policy_id, slot);
            info!(%policy_id, "policy worker stopped");
        }
    }

    /// Stop every worker and wait up to `grace` for them to finish; the
    /// stragglers are aborted.
    pub async fn stop_all(&self, grace: Duration) {
        let slots: Vec<(PolicyId, WorkerSlot)> = self.workers().drain().collect();
        for (policy_id, slot) in slots {
            self.retire(&policy_id, slot);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.retired())
            .into_iter()
            .map(|r| r.handle)
            .collect();

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "workers did not finish within the grace period");
        }
        info!("all policy workers stopped");
    }

    /// Policy ids with an active worker, sorted.
    pub fn active_workers(&self) -> Vec<PolicyId> {
        let mut ids: Vec<PolicyId> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, policy_id: &str) -> bool {
        self.workers().contains_key(policy_id)
    }
}

impl PolicyRunner for AutoscaleManager {
    fn start(&self, policy: ScalingPolicy, ownership: watch::Receiver<Ownership>) {
        self.start_worker(policy, ownership);
    }

    fn stop(&self, policy_id: &str) {
        self.stop_worker(policy_id);
    }
}

// ── Worker ─────────────────────────────────────────────────────────

struct PolicyWorker {
    policy: ScalingPolicy,
    interval: Duration,
    cooldown: Duration,
    adapter: Arc<CoordinationAdapter>,
    metrics: Arc<dyn MetricSource>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
    ownership: watch::Receiver<Ownership>,
    /// Reads `true` once the manager has stopped or replaced this worker.
    shutdown: watch::Receiver<bool>,
    /// Loaded from the store on the first cycle, so a new owner inherits
    /// the previous owner's cooldown.
    state: Option<RunState>,
}

impl PolicyWorker {
    /// `_exited` is dropped when this returns, which releases any worker
    /// queued behind this one.
    async fn run(mut self, previous: Vec<watch::Receiver<()>>, _exited: watch::Sender<()>) {
        let policy_id = self.policy.id.clone();
        let mut shutdown = self.shutdown.clone();
        for mut earlier in previous {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = earlier.changed() => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ownership = self.ownership.clone();

        debug!(%policy_id, "policy worker running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = ownership.changed() => {
                    if changed.is_err() || *ownership.borrow() == Ownership::Lost {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(()) => {}
                Err(e) if e.is_ownership_lost() => {
                    warn!(%policy_id, error = %e, "no longer the owner; worker exiting");
                    break;
                }
                Err(e) => warn!(%policy_id, error = %e, "evaluation cycle failed"),
            }
        }
        debug!(%policy_id, "policy worker exited");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One evaluation cycle.
    async fn tick(&mut self) -> CoordResult<()> {
        let policy_id = self.policy.id.clone();
        if *self.ownership.borrow() != Ownership::Owned {
            debug!(%policy_id, "ownership unconfirmed; skipping cycle");
            return Ok(());
        }

        let mut state = match self.state.take() {
            Some(state) => state,
            None => self
                .adapter
                .load_run_state(&policy_id)
                .await?
                .unwrap_or_else(|| RunState::new(&policy_id, self.adapter.node())),
        };
        state.owner = self.adapter.node().to_string();
        state.phase = Phase::Evaluating;
        let now = self.clock.now_ms();

        let value = match self.metrics.query(&self.policy.query).await {
            Ok(value) => value,
            Err(e) => {
                warn!(%policy_id, error = %e, transient = e.is_transient(), "metric query failed; skipping cycle");
                state.phase = Phase::Idle;
                self.state = Some(state);
                return Ok(());
            }
        };
        if self.stopping() {
            debug!(%policy_id, "worker stopped during the cycle; discarding it");
            return Ok(());
        }
        state.last_evaluated_at = Some(now);
        state.last_value = Some(value);

        let result = match evaluate(&self.policy, value, &state, now) {
            Decision::NoAction => {
                state.phase = Phase::NoAction;
                self.adapter.save_run_state(&state).await
            }
            Decision::Cooling { until } => {
                debug!(%policy_id, value, until, "threshold crossed during cooldown");
                state.phase = Phase::Cooling;
                self.adapter.save_run_state(&state).await
            }
            Decision::Scale {
                direction,
                magnitude,
            } => self.act(&mut state, direction, magnitude, value, now).await,
        };
        self.state = Some(state);
        result
    }

    /// Silence check, pending record, dispatch, final record.
    async fn act(
        &self,
        state: &mut RunState,
        direction: Direction,
        magnitude: u32,
        value: f64,
        now: u64,
    ) -> CoordResult<()> {
        let policy_id = &self.policy.id;
        let id = action_id(&self.policy.fleet, policy_id, direction);

        let silences = SilenceSet::new(self.adapter.load_silences().await?);
        if let Some(silence) = silences.matching(&id, now) {
            info!(%policy_id, action = %id, silence_id = %silence.id, "action silenced");
            state.phase = Phase::NoAction;
            state.last_action = Some(ActionRecord {
                id,
                direction,
                magnitude,
                outcome: ActionOutcome::Silenced {
                    silence_id: silence.id.clone(),
                },
                at: now,
            });
            return self.adapter.save_run_state(state).await;
        }

        if self.stopping() || *self.ownership.borrow() != Ownership::Owned {
            debug!(%policy_id, "ownership unconfirmed or worker stopped; not dispatching");
            return Ok(());
        }

        // The cooldown is on record before anything is sent, so an owner
        // taking over after a crash cannot repeat this action.
        let cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX);
        let mut pending = state.clone();
        pending.phase = Phase::Acting;
        pending.cooldown_until = Some(now.saturating_add(cooldown_ms));
        pending.last_action = Some(ActionRecord {
            id: id.clone(),
            direction,
            magnitude,
            outcome: ActionOutcome::Pending,
            at: now,
        });
        self.adapter.save_run_state(&pending).await?;
        *state = pending;

        info!(%policy_id, action = %id, value, magnitude, "dispatching scale action");
        let request = ActionRequest {
            id,
            policy_id: policy_id.clone(),
            fleet: self.policy.fleet.clone(),
            direction,
            magnitude,
            value,
            target: self.policy.action.clone(),
        };
        let outcome = match self.executor.execute(&request).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => {
                warn!(%policy_id, action = %request.id, error = %e, "scale action failed");
                ActionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let done = self.clock.now_ms();
        state.phase = Phase::Cooling;
        state.cooldown_until = Some(now.max(done).saturating_add(cooldown_ms));
        if let Some(record) = state.last_action.as_mut() {
            record.outcome = outcome;
        }
        self.adapter.save_run_state(state).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use scalegrid_coord::{CoordConfig, CoordError};
    use scalegrid_state::{KvStore, ManualClock, RecordStore, Silence, StateStore};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::{ActionError, MetricError, MetricResult};

    const MINUTE: Duration = Duration::from_secs(60);

    struct FakeSource {
        value: Mutex<Option<f64>>,
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn query(&self, _expr: &str) -> MetricResult<f64> {
            self.value
                .lock()
                .unwrap()
                .ok_or_else(|| MetricError::Unavailable("connection refused".into()))
        }
    }

    /// Holds every query until a permit is added.
    struct BlockingSource {
        permits: Semaphore,
    }

    #[async_trait]
    impl MetricSource for BlockingSource {
        async fn query(&self, _expr: &str) -> MetricResult<f64> {
            self.permits
                .acquire()
                .await
                .map_err(|_| MetricError::Unavailable("closed".into()))?
                .forget();
            Ok(85.0)
        }
    }

    /// Records every dispatch together with the run state stored at that
    /// moment.
    struct RecordingExecutor {
        store: Arc<dyn KvStore>,
        calls: Mutex<Vec<(ActionRequest, Option<RunState>)>>,
        fail: AtomicBool,
    }

    impl RecordingExecutor {
        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError> {
            let stored = self.store.get_run_state(&request.policy_id).await.unwrap();
            self.calls.lock().unwrap().push((request.clone(), stored));
            if self.fail.load(Ordering::SeqCst) {
                return Err(ActionError::Network("connection reset".into()));
            }
            Ok(())
        }
    }

    fn policy() -> ScalingPolicy {
        serde_json::from_value(serde_json::json!({
            "id": "p1",
            "fleet": "web",
            "query": "avg(cpu)",
            "scale_out": {"threshold": 80.0, "magnitude": 1},
            "scale_in": null,
            "cooldown": "5m",
            "interval": "1m",
            "action": {"url": "http://actions/scale"}
        }))
        .unwrap()
    }

    struct Harness {
        store: Arc<dyn KvStore>,
        clock: ManualClock,
        metrics: Arc<FakeSource>,
        executor: Arc<RecordingExecutor>,
        gate: watch::Sender<Ownership>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(1_700_000_000_000);
            let store: Arc<dyn KvStore> = Arc::new(
                StateStore::open_in_memory()
                    .unwrap()
                    .with_clock(Arc::new(clock.clone())),
            );
            Self {
                store: store.clone(),
                clock,
                metrics: Arc::new(FakeSource {
                    value: Mutex::new(Some(85.0)),
                }),
                executor: Arc::new(RecordingExecutor {
                    store,
                    calls: Mutex::new(Vec::new()),
                    fail: AtomicBool::new(false),
                }),
                gate: watch::channel(Ownership::Owned).0,
            }
        }

        fn adapter(&self, node: &str) -> Arc<CoordinationAdapter> {
            let config = CoordConfig {
                lease_ttl: Duration::from_secs(24 * 3600),
                ..Default::default()
            };
            Arc::new(CoordinationAdapter::new(self.store.clone(), node, config))
        }

        async fn owner(&self, node: &str) -> Arc<CoordinationAdapter> {
            let adapter = self.adapter(node);
            adapter.acquire_lease("p1").await.unwrap();
            adapter
        }

        fn manager(&self, adapter: Arc<CoordinationAdapter>) -> AutoscaleManager {
            AutoscaleManager::new(
                adapter,
                self.metrics.clone(),
                self.executor.clone(),
                Arc::new(self.clock.clone()),
            )
        }

        fn worker(&self, adapter: Arc<CoordinationAdapter>) -> PolicyWorker {
            let policy = policy();
            PolicyWorker {
                interval: policy.interval_duration().unwrap(),
                cooldown: policy.cooldown_duration().unwrap(),
                policy,
                adapter,
                metrics: self.metrics.clone(),
                executor: self.executor.clone(),
                clock: Arc::new(self.clock.clone()),
                ownership: self.gate.subscribe(),
                shutdown: watch::channel(false).1,
                state: None,
            }
        }

        async fn run_state(&self) -> RunState {
            self.store.get_run_state("p1").await.unwrap().unwrap()
        }

        fn set_metric(&self, value: Option<f64>) {
            *self.metrics.value.lock().unwrap() = value;
        }
    }

    #[tokio::test]
    async fn one_action_per_cooldown_window() {
        let h = Harness::new();
        let mut worker = h.worker(h.owner("node-a").await);

        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);
        let state = h.run_state().await;
        assert_eq!(state.phase, Phase::Cooling);
        assert_eq!(
            state.last_action.as_ref().unwrap().outcome,
            ActionOutcome::Succeeded
        );

        h.clock.advance(MINUTE);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);
        assert_eq!(h.run_state().await.phase, Phase::Cooling);

        h.clock.advance(5 * MINUTE);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 2);
    }

    #[tokio::test]
    async fn pending_record_precedes_dispatch() {
        let h = Harness::new();
        let start = h.clock.now_ms();
        let mut worker = h.worker(h.owner("node-a").await);
        worker.tick().await.unwrap();

        let calls = h.executor.calls.lock().unwrap();
        let (request, stored) = &calls[0];
        assert_eq!(request.id, "web/p1/scale-out");
        assert_eq!(request.value, 85.0);
        let stored = stored.as_ref().expect("run state written before dispatch");
        assert_eq!(stored.phase, Phase::Acting);
        assert_eq!(stored.owner, "node-a");
        assert_eq!(stored.cooldown_until, Some(start + 5 * 60_000));
        assert_eq!(
            stored.last_action.as_ref().unwrap().outcome,
            ActionOutcome::Pending
        );
    }

    #[tokio::test]
    async fn failed_dispatch_still_starts_the_cooldown() {
        let h = Harness::new();
        h.executor.fail.store(true, Ordering::SeqCst);
        let mut worker = h.worker(h.owner("node-a").await);

        worker.tick().await.unwrap();
        let state = h.run_state().await;
        assert!(matches!(
            state.last_action.unwrap().outcome,
            ActionOutcome::Failed { .. }
        ));

        h.clock.advance(MINUTE);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);
    }

    #[tokio::test]
    async fn silence_suppresses_until_it_expires() {
        let h = Harness::new();
        let mut silence = Silence {
            id: String::new(),
            name: "deploy freeze".into(),
            pattern: "^web/p1/scale-out$".into(),
            ttl: "10m".into(),
            tags: vec![],
            description: String::new(),
            created_at: 0,
            expired_at: 0,
        };
        silence.validate(h.clock.now_ms()).unwrap();
        h.store.put_silence(&silence).await.unwrap();

        let mut worker = h.worker(h.owner("node-a").await);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 0);
        let state = h.run_state().await;
        assert_eq!(
            state.last_action.unwrap().outcome,
            ActionOutcome::Silenced {
                silence_id: silence.id.clone()
            }
        );
        // Silenced actions do not start the cooldown.
        assert_eq!(state.cooldown_until, None);

        h.clock.advance(5 * MINUTE);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 0);

        h.clock.advance(6 * MINUTE);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);
    }

    #[tokio::test]
    async fn new_owner_inherits_the_cooldown() {
        let h = Harness::new();
        let a = h.owner("node-a").await;
        let mut worker_a = h.worker(a.clone());
        worker_a.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);

        // Ownership moves to node-b.
        a.release_lease("p1").await.unwrap();
        let mut worker_b = h.worker(h.owner("node-b").await);

        h.clock.advance(MINUTE);
        worker_b.tick().await.unwrap();
        assert_eq!(h.executor.count(), 1);
        let state = h.run_state().await;
        assert_eq!(state.owner, "node-b");
        assert_eq!(state.phase, Phase::Cooling);

        h.clock.advance(5 * MINUTE);
        worker_b.tick().await.unwrap();
        assert_eq!(h.executor.count(), 2);
    }

    #[tokio::test]
    async fn non_owner_never_dispatches() {
        let h = Harness::new();
        let _owner = h.owner("node-a").await;
        let mut intruder = h.worker(h.adapter("node-b"));

        let err = intruder.tick().await.unwrap_err();
        assert!(matches!(err, CoordError::NotOwner { .. }));
        assert_eq!(h.executor.count(), 0);
    }

    #[tokio::test]
    async fn unconfirmed_ownership_and_metric_outages_skip_the_cycle() {
        let h = Harness::new();
        let mut worker = h.worker(h.owner("node-a").await);

        h.gate.send_replace(Ownership::Unknown);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 0);

        h.gate.send_replace(Ownership::Owned);
        h.set_metric(None);
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 0);

        h.set_metric(Some(50.0));
        worker.tick().await.unwrap();
        assert_eq!(h.executor.count(), 0);
        assert_eq!(h.run_state().await.phase, Phase::NoAction);
        assert_eq!(h.run_state().await.last_value, Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn workers_start_stop_and_drain() {
        let h = Harness::new();
        let manager = h.manager(h.owner("node-a").await);

        manager.start_worker(policy(), h.gate.subscribe());
        assert_eq!(manager.active_workers(), vec!["p1"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The first cycle runs immediately.
        assert_eq!(h.executor.count(), 1);

        manager.stop_worker("p1");
        assert!(!manager.is_running("p1"));

        // A stopped worker never evaluates again, even past the cooldown.
        h.clock.advance(10 * MINUTE);
        tokio::time::sleep(10 * MINUTE).await;
        assert_eq!(h.executor.count(), 1);

        manager.start_worker(policy(), h.gate.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.executor.count(), 2);
        manager.stop_all(Duration::from_secs(1)).await;
        assert!(manager.active_workers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_worker_mid_cycle_dispatches_once() {
        let h = Harness::new();
        let source = Arc::new(BlockingSource {
            permits: Semaphore::new(0),
        });
        let manager = AutoscaleManager::new(
            h.owner("node-a").await,
            source.clone(),
            h.executor.clone(),
            Arc::new(h.clock.clone()),
        );
        manager.start_worker(policy(), h.gate.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.executor.count(), 0);

        // An edit arrives while the first cycle is still waiting on the query.
        let mut edited = policy();
        edited.description = "edited".into();
        manager.start_worker(edited, h.gate.subscribe());
        source.permits.add_permits(10);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.executor.count(), 1);
        assert_eq!(manager.active_workers(), vec!["p1"]);

        // The replacement honors the cooldown of that single dispatch.
        tokio::time::sleep(MINUTE).await;
        assert_eq!(h.executor.count(), 1);
        assert_eq!(h.run_state().await.phase, Phase::Cooling);
        manager.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_waits_for_the_old_worker() {
        let h = Harness::new();
        let source = Arc::new(BlockingSource {
            permits: Semaphore::new(0),
        });
        let manager = AutoscaleManager::new(
            h.owner("node-a").await,
            source.clone(),
            h.executor.clone(),
            Arc::new(h.clock.clone()),
        );
        manager.start_worker(policy(), h.gate.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.stop_worker("p1");
        manager.start_worker(policy(), h.gate.subscribe());

        source.permits.add_permits(10);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.executor.count(), 1);
        manager.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_gate_ends_the_worker() {
        let h = Harness::new();
        let manager = h.manager(h.owner("node-a").await);
        manager.start_worker(policy(), h.gate.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.executor.count(), 1);

        h.gate.send_replace(Ownership::Lost);
        h.clock.advance(10 * MINUTE);
        tokio::time::sleep(10 * MINUTE).await;
        assert_eq!(h.executor.count(), 1);
        manager.stop_all(Duration::from_secs(1)).await;
    }
}
