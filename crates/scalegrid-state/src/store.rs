//! StateStore — redb-backed coordination store.
//!
//! Keys and values are plain strings in the `kv` table. Leases carry an
//! absolute expiry computed from the store's [`Clock`]; keys attached to a
//! lease are deleted when it expires or is revoked. Every mutation bumps the
//! store revision and is appended to a bounded in-memory event log that
//! backs [`KvStore::events_since`]. The store supports both on-disk and
//! in-memory backends (the latter for tests and single-node setups).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{StateError, StateResult};
use crate::kv::{EventBatch, EventKind, KvStore, LeaseId, PrefixSnapshot, WatchEvent};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Number of events kept for watchers. Older revisions are compacted.
const EVENT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    ttl_ms: u64,
    expires_at: u64,
}

/// A mutation recorded inside a write transaction, published on commit.
struct Change {
    kind: EventKind,
    key: String,
    value: Option<String>,
}

impl Change {
    fn put(key: &str, value: &str) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(value.to_string()),
        }
    }

    fn delete(key: &str) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: None,
        }
    }
}

struct FeedState {
    log: VecDeque<WatchEvent>,
    revision: u64,
}

impl FeedState {
    fn since(&self, revision: u64) -> EventBatch {
        let missing = match self.log.front() {
            Some(first) => first.revision > revision + 1,
            None => revision < self.revision,
        };
        if revision > self.revision || (revision < self.revision && missing) {
            return EventBatch {
                events: Vec::new(),
                revision: self.revision,
                compacted: true,
            };
        }
        EventBatch {
            events: self
                .log
                .iter()
                .filter(|e| e.revision > revision)
                .cloned()
                .collect(),
            revision: self.revision,
            compacted: false,
        }
    }

    fn publish(&mut self, events: Vec<WatchEvent>) {
        for event in events {
            self.revision = event.revision;
            if self.log.len() == EVENT_LOG_CAPACITY {
                self.log.pop_front();
            }
            self.log.push_back(event);
        }
    }
}

/// Change feed shared by all clones of a store. The mutex is held across
/// each write transaction so events are published in revision order.
struct Feed {
    state: Mutex<FeedState>,
    notify: Notify,
}

impl Feed {
    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    feed: Arc<Feed>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!(?path, revision = store.revision(), "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the clock used for lease expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_db(db: Database) -> StateResult<Self> {
        let db = Arc::new(db);
        let revision = Self::ensure_tables(&db)?;
        Ok(Self {
            db,
            clock: Arc::new(SystemClock),
            feed: Arc::new(Feed {
                state: Mutex::new(FeedState {
                    log: VecDeque::new(),
                    revision,
                }),
                notify: Notify::new(),
            }),
        })
    }

    /// Create all tables if they don't exist yet and return the stored revision.
    fn ensure_tables(db: &Database) -> StateResult<u64> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let revision;
        {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(KV).map_err(map_err!(Table))?;
            txn.open_table(LEASES).map_err(map_err!(Table))?;
            txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            revision = meta
                .get(META_REVISION)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(revision)
    }

    /// Revision of the most recent committed change.
    pub fn revision(&self) -> u64 {
        self.feed.lock().revision
    }

    // ── Write path ─────────────────────────────────────────────────

    /// Run `op` in a write transaction after reaping expired leases, then
    /// commit and publish the recorded changes. Returns the op's output and
    /// the revision after commit.
    fn write<T>(
        &self,
        op: impl FnOnce(&WriteTransaction, &mut Vec<Change>) -> StateResult<T>,
    ) -> StateResult<(T, u64)> {
        let mut feed = self.feed.lock();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut changes = Vec::new();

        let result = reap_in(&txn, self.clock.now_ms(), &mut changes)
            .and_then(|_| op(&txn, &mut changes));
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                let _ = txn.abort();
                return Err(e);
            }
        };

        let mut revision = feed.revision;
        let mut events = Vec::with_capacity(changes.len());
        if !changes.is_empty() {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            for change in changes {
                revision += 1;
                events.push(WatchEvent {
                    revision,
                    kind: change.kind,
                    key: change.key,
                    value: change.value,
                });
            }
            meta.insert(META_REVISION, revision)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if !events.is_empty() {
            feed.publish(events);
            drop(feed);
            self.feed.notify.notify_waiters();
        }
        Ok((out, revision))
    }

    /// Delete every expired lease and the keys attached to it. Returns the
    /// number of leases removed.
    pub fn reap_expired(&self) -> StateResult<usize> {
        let now = self.clock.now_ms();
        let expired = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let mut count = 0;
            for entry in leases.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: LeaseRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.expires_at <= now {
                    count += 1;
                }
            }
            count
        };
        if expired > 0 {
            self.write(|_, _| Ok(()))?;
            debug!(expired, "expired leases reaped");
        }
        Ok(expired)
    }

    // ── Key-value ──────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> StateResult<Option<String>> {
        self.reap_expired()?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|g| g.value().to_string());
        Ok(value)
    }

    /// Insert or overwrite a key. Returns the new revision.
    pub fn put(&self, key: &str, value: &str) -> StateResult<u64> {
        let ((), revision) = self.write(|txn, changes| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
            let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            kv.insert(key, value).map_err(map_err!(Write))?;
            key_leases.remove(key).map_err(map_err!(Write))?;
            changes.push(Change::put(key, value));
            Ok(())
        })?;
        Ok(revision)
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let (existed, _) = self.write(|txn, changes| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
            let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            let existed = kv.remove(key).map_err(map_err!(Write))?.is_some();
            key_leases.remove(key).map_err(map_err!(Write))?;
            if existed {
                changes.push(Change::delete(key));
            }
            Ok(existed)
        })?;
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// All entries whose key starts with `prefix`, ordered by key.
    pub fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
        self.reap_expired()?;
        // Hold the feed lock so the snapshot and its revision agree.
        let feed = self.feed.lock();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                entries.push((key.value().to_string(), value.value().to_string()));
            }
        }
        Ok(PrefixSnapshot {
            entries,
            revision: feed.revision,
        })
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
        let now = self.clock.now_ms();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let (id, _) = self.write(|txn, _| {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let id = meta
                .get(META_NEXT_LEASE)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0)
                + 1;
            meta.insert(META_NEXT_LEASE, id).map_err(map_err!(Write))?;

            let record = LeaseRecord {
                ttl_ms,
                expires_at: now.saturating_add(ttl_ms),
            };
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            leases
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(id)
        })?;
        debug!(lease = id, ttl_ms, "lease granted");
        Ok(id)
    }

    pub fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
        let now = self.clock.now_ms();
        self.write(|txn, _| {
            let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let mut record: LeaseRecord = match leases.get(lease).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::LeaseNotFound(lease)),
            };
            record.expires_at = now.saturating_add(record.ttl_ms);
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            leases
                .insert(lease, value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
        self.write(|txn, changes| {
            if !remove_lease(txn, lease, changes)? {
                return Err(StateError::LeaseNotFound(lease));
            }
            Ok(())
        })?;
        debug!(lease, "lease revoked");
        Ok(())
    }

    // ── Compare-and-swap ───────────────────────────────────────────

    /// Create `key` iff absent. Returns the existing value on conflict.
    pub fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StateResult<Option<String>> {
        let (existing, _) = self.write(|txn, changes| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
            let existing = kv
                .get(key)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            if existing.is_some() {
                return Ok(existing);
            }

            let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            match lease {
                Some(id) => {
                    let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
                    if leases.get(id).map_err(map_err!(Read))?.is_none() {
                        return Err(StateError::LeaseNotFound(id));
                    }
                    key_leases.insert(key, id).map_err(map_err!(Write))?;
                }
                None => {
                    key_leases.remove(key).map_err(map_err!(Write))?;
                }
            }
            kv.insert(key, value).map_err(map_err!(Write))?;
            changes.push(Change::put(key, value));
            Ok(None)
        })?;
        Ok(existing)
    }

    /// Delete `key` iff its current value equals `expected`.
    pub fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
        let (deleted, _) = self.write(|txn, changes| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
            let matches = kv
                .get(key)
                .map_err(map_err!(Read))?
                .is_some_and(|g| g.value() == expected);
            if !matches {
                return Ok(false);
            }
            kv.remove(key).map_err(map_err!(Write))?;
            let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            key_leases.remove(key).map_err(map_err!(Write))?;
            changes.push(Change::delete(key));
            Ok(true)
        })?;
        Ok(deleted)
    }

    /// Write `key` iff `guard_key` currently holds `expected`. The check and
    /// the write share one transaction, after expired leases are reaped.
    /// Returns whether the write happened.
    pub fn put_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        key: &str,
        value: &str,
    ) -> StateResult<bool> {
        let (written, _) = self.write(|txn, changes| {
            let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
            let matches = kv
                .get(guard_key)
                .map_err(map_err!(Read))?
                .is_some_and(|g| g.value() == expected);
            if !matches {
                return Ok(false);
            }
            kv.insert(key, value).map_err(map_err!(Write))?;
            let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
            key_leases.remove(key).map_err(map_err!(Write))?;
            changes.push(Change::put(key, value));
            Ok(true)
        })?;
        Ok(written)
    }

    // ── Change feed ────────────────────────────────────────────────

    /// Changes after `revision`, waiting up to `wait` for the first one.
    pub async fn wait_events(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
        self.reap_expired()?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let mut notified = std::pin::pin!(self.feed.notify.notified());
            notified.as_mut().enable();

            let batch = self.feed.lock().since(revision);
            if !batch.events.is_empty() || batch.compacted {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }
}

/// Delete leases whose expiry has passed, inside an open transaction.
fn reap_in(txn: &WriteTransaction, now: u64, changes: &mut Vec<Change>) -> StateResult<()> {
    let expired: Vec<LeaseId> = {
        let leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
        let mut expired = Vec::new();
        for entry in leases.iter().map_err(map_err!(Read))? {
            let (id, value) = entry.map_err(map_err!(Read))?;
            let record: LeaseRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.expires_at <= now {
                expired.push(id.value());
            }
        }
        expired
    };
    for id in expired {
        remove_lease(txn, id, changes)?;
        debug!(lease = id, "lease expired");
    }
    Ok(())
}

/// Remove a lease and its attached keys. Returns false if it did not exist.
fn remove_lease(
    txn: &WriteTransaction,
    lease: LeaseId,
    changes: &mut Vec<Change>,
) -> StateResult<bool> {
    let mut leases = txn.open_table(LEASES).map_err(map_err!(Table))?;
    if leases.remove(lease).map_err(map_err!(Write))?.is_none() {
        return Ok(false);
    }

    let mut key_leases = txn.open_table(KEY_LEASES).map_err(map_err!(Table))?;
    let mut attached = Vec::new();
    for entry in key_leases.iter().map_err(map_err!(Read))? {
        let (key, id) = entry.map_err(map_err!(Read))?;
        if id.value() == lease {
            attached.push(key.value().to_string());
        }
    }

    let mut kv = txn.open_table(KV).map_err(map_err!(Table))?;
    for key in attached {
        key_leases.remove(key.as_str()).map_err(map_err!(Write))?;
        if kv.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
            changes.push(Change::delete(&key));
        }
    }
    Ok(true)
}

#[async_trait]
impl KvStore for StateStore {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        StateStore::get(self, key)
    }

    async fn put(&self, key: &str, value: &str) -> StateResult<u64> {
        StateStore::put(self, key, value)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        StateStore::delete(self, key)
    }

    async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
        StateStore::list_prefix(self, prefix)
    }

    async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
        StateStore::grant_lease(self, ttl)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
        StateStore::keep_alive(self, lease)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
        StateStore::revoke_lease(self, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StateResult<Option<String>> {
        StateStore::put_if_absent(self, key, value, lease)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
        StateStore::delete_if_equals(self, key, expected)
    }

    async fn put_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        key: &str,
        value: &str,
    ) -> StateResult<bool> {
        StateStore::put_if_equals(self, guard_key, expected, key, value)
    }

    async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
        self.wait_events(revision, wait).await
    }
}
