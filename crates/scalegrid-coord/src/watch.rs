//! Restartable prefix watches over the store's change feed.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use scalegrid_state::{EventKind, KvStore, WatchEvent};
use tracing::{debug, warn};

use crate::error::{CoordError, CoordResult};

/// An endless stream of changes under one key prefix.
///
/// The first call to [`next`](PrefixWatch::next) lists the prefix and
/// yields every existing key as a put. After that, changes are long-polled
/// in revision order. If the store has compacted past the watch's
/// revision, the prefix is relisted: current keys come back as puts and
/// keys that vanished in the gap as deletes.
///
/// A failed `next` leaves the watch where it was, so the caller can simply
/// call it again.
pub struct PrefixWatch {
    store: Arc<dyn KvStore>,
    prefix: String,
    wait: Duration,
    call_timeout: Duration,
    revision: Option<u64>,
    known: BTreeSet<String>,
    pending: VecDeque<WatchEvent>,
}

impl PrefixWatch {
    pub(crate) fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        wait: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            wait,
            call_timeout,
            revision: None,
            known: BTreeSet::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Revision up to which changes have been observed.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Next change under the prefix. Cancel safe.
    pub async fn next(&mut self) -> CoordResult<WatchEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            match self.revision {
                None => self.relist().await?,
                Some(revision) => self.poll(revision).await?,
            }
        }
    }

    async fn relist(&mut self) -> CoordResult<()> {
        let snapshot = match tokio::time::timeout(
            self.call_timeout,
            self.store.list_prefix(&self.prefix),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CoordError::Timeout(self.call_timeout)),
        };

        let current: BTreeSet<String> = snapshot.entries.iter().map(|(k, _)| k.clone()).collect();
        for key in self.known.difference(&current) {
            self.pending.push_back(WatchEvent {
                revision: snapshot.revision,
                kind: EventKind::Delete,
                key: key.clone(),
                value: None,
            });
        }
        for (key, value) in snapshot.entries {
            self.pending.push_back(WatchEvent {
                revision: snapshot.revision,
                kind: EventKind::Put,
                key,
                value: Some(value),
            });
        }
        debug!(prefix = %self.prefix, revision = snapshot.revision, keys = current.len(), "prefix listed");
        self.known = current;
        self.revision = Some(snapshot.revision);
        Ok(())
    }

    async fn poll(&mut self, revision: u64) -> CoordResult<()> {
        let limit = self.wait + self.call_timeout;
        let batch = match tokio::time::timeout(
            limit,
            self.store.events_since(revision, self.wait),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CoordError::Timeout(limit)),
        };

        if batch.compacted {
            warn!(prefix = %self.prefix, revision, "watch fell behind the change feed; relisting");
            return self.relist().await;
        }

        for event in batch.events {
            if !event.key.starts_with(&self.prefix) {
                continue;
            }
            match event.kind {
                EventKind::Put => self.known.insert(event.key.clone()),
                EventKind::Delete => self.known.remove(&event.key),
            };
            self.pending.push_back(event);
        }
        self.revision = Some(batch.revision.max(revision));
        Ok(())
    }
}
