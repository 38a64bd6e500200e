//! Coordination adapter — per-policy leases and typed access to the store.
//!
//! Ownership of a policy is the key `locks/<policy>` holding the owner's
//! node name, attached to a TTL lease. Creating the key is a single
//! put-if-absent, so at most one node holds it at any revision; when the
//! holder stops renewing, the store deletes the key with the lease.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use scalegrid_state::{
    KvStore, LeaseId, NodeId, PolicyId, RecordStore, RunState, ScalingPolicy, Silence,
    StateError, StateResult, keys,
};
use tracing::{debug, info, warn};

use crate::error::{CoordError, CoordResult};
use crate::watch::PrefixWatch;

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted,
    AlreadyHeld { holder: NodeId },
}

/// Timing of lease and store calls.
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Lease TTL. Renewals run at a third of this.
    pub lease_ttl: Duration,
    /// Upper bound on any single store call.
    pub call_timeout: Duration,
    /// Long-poll duration of prefix watches.
    pub watch_wait: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            call_timeout: Duration::from_secs(5),
            watch_wait: Duration::from_secs(10),
        }
    }
}

impl CoordConfig {
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    /// How long after a renewal is sent the lease is still trusted
    /// locally: the TTL less one store call.
    pub fn ownership_window(&self) -> Duration {
        self.lease_ttl.saturating_sub(self.call_timeout)
    }
}

/// One node's handle on the coordination store.
pub struct CoordinationAdapter {
    store: Arc<dyn KvStore>,
    node: NodeId,
    config: CoordConfig,
    held: Mutex<HashMap<PolicyId, LeaseId>>,
}

impl CoordinationAdapter {
    pub fn new(store: Arc<dyn KvStore>, node: &str, config: CoordConfig) -> Self {
        Self {
            store,
            node: node.to_string(),
            config,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Bound a store call by the configured timeout.
    async fn call<T>(&self, fut: impl Future<Output = StateResult<T>>) -> CoordResult<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result.map_err(CoordError::from),
            Err(_) => Err(CoordError::Timeout(self.config.call_timeout)),
        }
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<PolicyId, LeaseId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Try to become the owner of `policy_id`.
    ///
    /// On conflict the freshly granted lease is revoked again. A lock held
    /// under this node's own name but by a lease this process does not
    /// know (left over from a previous run) counts as held by someone else
    /// until it expires.
    pub async fn acquire_lease(&self, policy_id: &str) -> CoordResult<LeaseOutcome> {
        if self.holds(policy_id) {
            return Ok(LeaseOutcome::Granted);
        }

        let lease = self
            .call(self.store.grant_lease(self.config.lease_ttl))
            .await?;
        let key = keys::lock(policy_id);
        let existing = match self
            .call(self.store.put_if_absent(&key, &self.node, Some(lease)))
            .await
        {
            Ok(existing) => existing,
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e);
            }
        };

        match existing {
            None => {
                self.held().insert(policy_id.to_string(), lease);
                info!(policy_id, lease, node = %self.node, "lease acquired");
                Ok(LeaseOutcome::Granted)
            }
            Some(holder) => {
                self.revoke_quietly(lease).await;
                debug!(policy_id, %holder, "lease already held");
                Ok(LeaseOutcome::AlreadyHeld { holder })
            }
        }
    }

    /// Extend the lease on `policy_id` and confirm the lock still names
    /// this node.
    pub async fn renew_lease(&self, policy_id: &str) -> CoordResult<()> {
        let lost = || CoordError::LeaseExpired {
            policy_id: policy_id.to_string(),
        };
        let lease = self.held().get(policy_id).copied().ok_or_else(lost)?;

        match self.call(self.store.keep_alive(lease)).await {
            Ok(()) => {}
            Err(CoordError::Store(StateError::LeaseNotFound(_))) => {
                self.forget(policy_id);
                return Err(lost());
            }
            Err(e) => return Err(e),
        }

        let holder = self.call(self.store.get(&keys::lock(policy_id))).await?;
        if holder.as_deref() != Some(self.node.as_str()) {
            self.forget(policy_id);
            self.revoke_quietly(lease).await;
            return Err(lost());
        }
        Ok(())
    }

    /// Delete the lock iff it still names this node, then revoke the
    /// lease. Returns whether a lock was removed.
    pub async fn release_lease(&self, policy_id: &str) -> CoordResult<bool> {
        let lease = self.held().remove(policy_id);
        let released = self
            .call(self.store.delete_if_equals(&keys::lock(policy_id), &self.node))
            .await?;
        if let Some(lease) = lease {
            self.revoke_quietly(lease).await;
        }
        if released {
            info!(policy_id, node = %self.node, "lease released");
        }
        Ok(released)
    }

    /// Drop local knowledge of a lease without touching the store. The
    /// store expires it on its own.
    pub fn forget(&self, policy_id: &str) -> Option<LeaseId> {
        self.held().remove(policy_id)
    }

    pub fn holds(&self, policy_id: &str) -> bool {
        self.held().contains_key(policy_id)
    }

    /// Policies this node currently believes it owns.
    pub fn held_policies(&self) -> Vec<PolicyId> {
        let mut ids: Vec<PolicyId> = self.held().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        match self.call(self.store.revoke_lease(lease)).await {
            Ok(()) | Err(CoordError::Store(StateError::LeaseNotFound(_))) => {}
            Err(e) => warn!(lease, error = %e, "failed to revoke lease; it will expire"),
        }
    }

    // ── Records ────────────────────────────────────────────────────

    pub async fn load_policies(&self) -> CoordResult<Vec<ScalingPolicy>> {
        self.call(self.store.list_policies()).await
    }

    pub async fn load_policy(&self, policy_id: &str) -> CoordResult<Option<ScalingPolicy>> {
        self.call(self.store.get_policy(policy_id)).await
    }

    pub async fn load_run_state(&self, policy_id: &str) -> CoordResult<Option<RunState>> {
        self.call(self.store.get_run_state(policy_id)).await
    }

    /// Persist run state, but only while the lock names this node. The
    /// check and the write are one store transaction.
    pub async fn save_run_state(&self, state: &RunState) -> CoordResult<()> {
        let written = self
            .call(self.store.put_run_state_as(&self.node, state))
            .await?;
        if !written {
            return Err(CoordError::NotOwner {
                policy_id: state.policy_id.clone(),
                node: self.node.clone(),
            });
        }
        Ok(())
    }

    pub async fn load_silences(&self) -> CoordResult<Vec<Silence>> {
        self.call(self.store.list_silences()).await
    }

    pub async fn owner_of(&self, policy_id: &str) -> CoordResult<Option<NodeId>> {
        self.call(self.store.get(&keys::lock(policy_id))).await
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Watch every key under `prefix`, starting from its current contents.
    pub fn watch(&self, prefix: &str) -> PrefixWatch {
        PrefixWatch::new(
            self.store.clone(),
            prefix,
            self.config.watch_wait,
            self.config.call_timeout,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use scalegrid_state::{Clock, EventBatch, ManualClock, PrefixSnapshot, StateStore};

    use super::*;

    const TTL: Duration = Duration::from_secs(15);

    fn shared_store() -> (Arc<dyn KvStore>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (Arc::new(store), clock)
    }

    fn adapter(store: &Arc<dyn KvStore>, node: &str) -> CoordinationAdapter {
        CoordinationAdapter::new(store.clone(), node, CoordConfig::default())
    }

    #[tokio::test]
    async fn second_acquirer_sees_holder() {
        let (store, _) = shared_store();
        let a = adapter(&store, "node-a");
        let b = adapter(&store, "node-b");

        assert_eq!(a.acquire_lease("p1").await.unwrap(), LeaseOutcome::Granted);
        assert_eq!(
            b.acquire_lease("p1").await.unwrap(),
            LeaseOutcome::AlreadyHeld {
                holder: "node-a".into()
            }
        );
        assert!(a.holds("p1"));
        assert!(!b.holds("p1"));
        // Re-acquiring an owned policy is a no-op.
        assert_eq!(a.acquire_lease("p1").await.unwrap(), LeaseOutcome::Granted);
    }

    #[tokio::test]
    async fn expired_lease_hands_over_ownership() {
        let (store, clock) = shared_store();
        let a = adapter(&store, "node-a");
        let b = adapter(&store, "node-b");
        a.acquire_lease("p1").await.unwrap();

        clock.advance(TTL + Duration::from_millis(1));
        assert_eq!(b.acquire_lease("p1").await.unwrap(), LeaseOutcome::Granted);

        let err = a.renew_lease("p1").await.unwrap_err();
        assert!(matches!(err, CoordError::LeaseExpired { .. }));
        assert!(!a.holds("p1"));
        assert_eq!(a.owner_of("p1").await.unwrap().as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn renewal_keeps_the_lease_alive() {
        let (store, clock) = shared_store();
        let a = adapter(&store, "node-a");
        a.acquire_lease("p1").await.unwrap();

        for _ in 0..10 {
            clock.advance(TTL / 3);
            a.renew_lease("p1").await.unwrap();
        }
        assert_eq!(a.owner_of("p1").await.unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn release_never_deletes_someone_elses_lock() {
        let (store, clock) = shared_store();
        let a = adapter(&store, "node-a");
        let b = adapter(&store, "node-b");
        a.acquire_lease("p1").await.unwrap();

        clock.advance(TTL * 2);
        b.acquire_lease("p1").await.unwrap();

        assert!(!a.release_lease("p1").await.unwrap());
        assert_eq!(b.owner_of("p1").await.unwrap().as_deref(), Some("node-b"));

        assert!(b.release_lease("p1").await.unwrap());
        assert_eq!(b.owner_of("p1").await.unwrap(), None);
        assert!(b.held_policies().is_empty());
    }

    #[tokio::test]
    async fn stale_lock_under_own_name_waits_for_expiry() {
        let (store, clock) = shared_store();
        let before = adapter(&store, "node-a");
        before.acquire_lease("p1").await.unwrap();

        // Same node name, fresh process: the old lease is unknown here.
        let after = adapter(&store, "node-a");
        assert_eq!(
            after.acquire_lease("p1").await.unwrap(),
            LeaseOutcome::AlreadyHeld {
                holder: "node-a".into()
            }
        );

        clock.advance(TTL + Duration::from_millis(1));
        assert_eq!(after.acquire_lease("p1").await.unwrap(), LeaseOutcome::Granted);
    }

    #[tokio::test]
    async fn run_state_writes_are_owner_guarded() {
        let (store, _) = shared_store();
        let a = adapter(&store, "node-a");
        let b = adapter(&store, "node-b");
        a.acquire_lease("p1").await.unwrap();

        a.save_run_state(&RunState::new("p1", "node-a")).await.unwrap();
        let err = b
            .save_run_state(&RunState::new("p1", "node-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotOwner { .. }));
        assert!(err.is_ownership_lost());

        let state = b.load_run_state("p1").await.unwrap().unwrap();
        assert_eq!(state.owner, "node-a");
    }

    /// Lets node-a's lease lapse and hands the lock to node-b just as the
    /// first guarded write arrives.
    struct HandoverStore {
        inner: StateStore,
        clock: ManualClock,
        armed: AtomicBool,
    }

    #[async_trait]
    impl KvStore for HandoverStore {
        async fn get(&self, key: &str) -> StateResult<Option<String>> {
            self.inner.get(key)
        }
        async fn put(&self, key: &str, value: &str) -> StateResult<u64> {
            self.inner.put(key, value)
        }
        async fn delete(&self, key: &str) -> StateResult<bool> {
            self.inner.delete(key)
        }
        async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
            self.inner.list_prefix(prefix)
        }
        async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
            self.inner.grant_lease(ttl)
        }
        async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
            self.inner.keep_alive(lease)
        }
        async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
            self.inner.revoke_lease(lease)
        }
        async fn put_if_absent(
            &self,
            key: &str,
            value: &str,
            lease: Option<LeaseId>,
        ) -> StateResult<Option<String>> {
            self.inner.put_if_absent(key, value, lease)
        }
        async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
            self.inner.delete_if_equals(key, expected)
        }
        async fn put_if_equals(
            &self,
            guard_key: &str,
            expected: &str,
            key: &str,
            value: &str,
        ) -> StateResult<bool> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.clock.advance(TTL + Duration::from_millis(1));
                let lease = self.inner.grant_lease(TTL)?;
                self.inner.put_if_absent(guard_key, "node-b", Some(lease))?;
                let theirs = serde_json::to_string(&RunState::new("p1", "node-b")).unwrap();
                self.inner.put(key, &theirs)?;
            }
            self.inner.put_if_equals(guard_key, expected, key, value)
        }
        async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
            self.inner.wait_events(revision, wait).await
        }
    }

    #[tokio::test]
    async fn handover_during_a_run_state_write_keeps_the_new_owners_record() {
        let clock = ManualClock::new(1_000);
        let inner = StateStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let handover = Arc::new(HandoverStore {
            inner,
            clock,
            armed: AtomicBool::new(false),
        });
        let store: Arc<dyn KvStore> = handover.clone();
        let a = adapter(&store, "node-a");
        a.acquire_lease("p1").await.unwrap();
        a.save_run_state(&RunState::new("p1", "node-a")).await.unwrap();

        handover.armed.store(true, Ordering::SeqCst);
        let mut pending = RunState::new("p1", "node-a");
        pending.cooldown_until = Some(999);
        let err = a.save_run_state(&pending).await.unwrap_err();
        assert!(matches!(err, CoordError::NotOwner { .. }));

        let stored = store.get_run_state("p1").await.unwrap().unwrap();
        assert_eq!(stored.owner, "node-b");
        assert_eq!(stored.cooldown_until, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_yield_one_owner() {
        let (store, clock) = shared_store();
        for round in 0..5 {
            let policy = format!("p{round}");
            let mut tasks = Vec::new();
            for n in 0..8 {
                let adapter = Arc::new(adapter(&store, &format!("node-{n}")));
                let policy = policy.clone();
                tasks.push(tokio::spawn(async move {
                    adapter.acquire_lease(&policy).await.unwrap()
                }));
            }
            let mut granted = 0;
            for task in tasks {
                if task.await.unwrap() == LeaseOutcome::Granted {
                    granted += 1;
                }
            }
            assert_eq!(granted, 1, "round {round} at {}", clock.now_ms());
        }
    }
}
