//! Typed JSON records over any [`KvStore`].

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{StateError, StateResult};
use crate::keys;
use crate::kv::KvStore;
use crate::types::*;

fn encode<T: Serialize>(value: &T) -> StateResult<String> {
    serde_json::to_string(value).map_err(|e| StateError::Serialize(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &str) -> StateResult<T> {
    serde_json::from_str(raw).map_err(|e| StateError::Deserialize(e.to_string()))
}

/// Typed accessors for policies, run state, silences and locks.
///
/// Implemented for every `KvStore`, including trait objects.
#[async_trait]
pub trait RecordStore: KvStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> StateResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Decode every record under `prefix`. Undecodable entries are logged
    /// and skipped so one bad record cannot hide the rest.
    async fn list_json<T: DeserializeOwned + Send>(&self, prefix: &str) -> StateResult<Vec<T>> {
        let snapshot = self.list_prefix(prefix).await?;
        let mut out = Vec::with_capacity(snapshot.entries.len());
        for (key, raw) in snapshot.entries {
            match decode(&raw) {
                Ok(value) => out.push(value),
                Err(e) => warn!(%key, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> StateResult<u64> {
        let raw = encode(value)?;
        self.put(key, &raw).await
    }

    // ── Policies ───────────────────────────────────────────────────

    async fn get_policy(&self, id: &str) -> StateResult<Option<ScalingPolicy>> {
        self.get_json(&keys::policy(id)).await
    }

    async fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        self.list_json(keys::POLICIES).await
    }

    async fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<u64> {
        self.put_json(&keys::policy(&policy.id), policy).await
    }

    /// Delete a policy together with its run state.
    async fn delete_policy(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(&keys::policy(id)).await?;
        self.delete(&keys::run_state(id)).await?;
        Ok(existed)
    }

    // ── Run state ──────────────────────────────────────────────────

    async fn get_run_state(&self, policy_id: &str) -> StateResult<Option<RunState>> {
        self.get_json(&keys::run_state(policy_id)).await
    }

    async fn put_run_state(&self, state: &RunState) -> StateResult<u64> {
        self.put_json(&keys::run_state(&state.policy_id), state).await
    }

    /// Write run state only while `locks/<policy>` names `owner`. Returns
    /// whether it was written.
    async fn put_run_state_as(&self, owner: &str, state: &RunState) -> StateResult<bool> {
        let raw = encode(state)?;
        self.put_if_equals(
            &keys::lock(&state.policy_id),
            owner,
            &keys::run_state(&state.policy_id),
            &raw,
        )
        .await
    }

    // ── Silences ───────────────────────────────────────────────────

    async fn list_silences(&self) -> StateResult<Vec<Silence>> {
        self.list_json(keys::SILENCES).await
    }

    async fn put_silence(&self, silence: &Silence) -> StateResult<u64> {
        self.put_json(&keys::silence(&silence.id), silence).await
    }

    async fn delete_silence(&self, id: &str) -> StateResult<bool> {
        self.delete(&keys::silence(id)).await
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Current lock holders as `(policy id, node)` pairs.
    async fn list_locks(&self) -> StateResult<Vec<(PolicyId, NodeId)>> {
        let snapshot = self.list_prefix(keys::LOCKS).await?;
        Ok(snapshot
            .entries
            .into_iter()
            .filter_map(|(key, owner)| {
                keys::id_of(keys::LOCKS, &key).map(|id| (id.to_string(), owner))
            })
            .collect())
    }
}

impl<S: KvStore + ?Sized> RecordStore for S {}
