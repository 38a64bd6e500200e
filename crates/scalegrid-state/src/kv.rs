//! The coordination-store interface.
//!
//! `KvStore` is the narrow set of primitives the rest of scalegrid relies
//! on: plain key-value access, TTL leases, compare-and-swap on absence or
//! value, and a revision-ordered change feed for prefix watches.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StateResult;

/// Identifier of a TTL lease.
pub type LeaseId = u64;

/// Kind of a change in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Delete,
}

/// A single change, stamped with the store revision that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub revision: u64,
    pub kind: EventKind,
    pub key: String,
    /// New value for puts; `None` for deletes.
    pub value: Option<String>,
}

/// Result of a long-poll on the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Events with revision greater than the requested one, in order.
    pub events: Vec<WatchEvent>,
    /// Store revision at the time of the reply.
    pub revision: u64,
    /// The requested revision is older than the retained log; the caller
    /// must relist and resume from `revision`.
    pub compacted: bool,
}

/// All entries under a prefix, consistent as of `revision`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixSnapshot {
    pub entries: Vec<(String, String)>,
    pub revision: u64,
}

/// Transactional key-value store with leases and a change feed.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    /// Unconditional write. Detaches the key from any lease it had.
    async fn put(&self, key: &str, value: &str) -> StateResult<u64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StateResult<bool>;

    async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot>;

    async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId>;

    /// Push the lease's expiry out by its TTL. Fails with
    /// `StateError::LeaseNotFound` once the lease has expired or been revoked.
    async fn keep_alive(&self, lease: LeaseId) -> StateResult<()>;

    /// Revoke a lease and delete every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()>;

    /// Atomically create `key` iff it is absent. Returns `None` on success
    /// or the current value if the key already exists.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StateResult<Option<String>>;

    /// Atomically delete `key` iff its value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool>;

    /// Atomically write `key` iff `guard_key` holds `expected`. Returns
    /// whether the write happened.
    async fn put_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        key: &str,
        value: &str,
    ) -> StateResult<bool>;

    /// Changes after `revision`, waiting up to `wait` for the first one.
    async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch>;
}

// ── HTTP wire types (shared by RemoteStore and the store service) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueBody {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionBody {
    pub revision: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistedBody {
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseGrantBody {
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseBody {
    pub id: LeaseId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutIfAbsentBody {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingBody {
    pub existing: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteIfEqualsBody {
    pub key: String,
    pub expected: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutIfEqualsBody {
    pub guard_key: String,
    pub expected: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenBody {
    pub written: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixQuery {
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsQuery {
    pub since: u64,
    pub wait_ms: u64,
}

/// Error reply of the store service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreErrorBody {
    pub error: String,
    /// Set to the lease id when the failure is a missing lease.
    pub lease_not_found: Option<LeaseId>,
}
