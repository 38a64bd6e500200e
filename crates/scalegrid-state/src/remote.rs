//! RemoteStore — HTTP client for a store served by `scalegridd store`.
//!
//! Every node of a multi-host cluster points at the same store service.
//! Transport failures map to [`StateError::Unavailable`] or
//! [`StateError::Timeout`] so callers can tell them apart from conflicts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::*;

/// Request timeout used when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl RemoteStore {
    /// Create a client for the store at `base` (e.g. `http://10.0.0.5:8700`).
    pub fn new(base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base))
            .timeout(self.timeout)
    }

    async fn send(&self, req: RequestBuilder, timeout: Duration) -> StateResult<Response> {
        let resp = req.send().await.map_err(|e| transport_error(e, timeout))?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        Err(error_from_response(resp).await)
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> StateResult<T> {
        let resp = self.send(req, self.timeout).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(error_from_response(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> StateError {
    if e.is_timeout() {
        StateError::Timeout(timeout)
    } else {
        StateError::Unavailable(e.to_string())
    }
}

async fn error_from_response(resp: Response) -> StateError {
    let status = resp.status();
    match resp.json::<StoreErrorBody>().await {
        Ok(StoreErrorBody {
            lease_not_found: Some(id),
            ..
        }) => StateError::LeaseNotFound(id),
        Ok(body) if status.is_server_error() => StateError::Unavailable(body.error),
        Ok(body) => StateError::Write(body.error),
        Err(_) if status == StatusCode::NOT_FOUND => StateError::Read(format!("store replied {status}")),
        Err(_) => StateError::Unavailable(format!("store replied {status}")),
    }
}

#[async_trait]
impl KvStore for RemoteStore {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let req = self.request(Method::GET, &format!("/v1/kv/key/{key}"));
        let resp = self.send(req, self.timeout).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ValueBody = resp
            .json()
            .await
            .map_err(|e| StateError::Deserialize(e.to_string()))?;
        Ok(Some(body.value))
    }

    async fn put(&self, key: &str, value: &str) -> StateResult<u64> {
        let req = self
            .request(Method::PUT, &format!("/v1/kv/key/{key}"))
            .json(&ValueBody {
                value: value.to_string(),
            });
        let body: RevisionBody = self.json(req).await?;
        Ok(body.revision)
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        let req = self.request(Method::DELETE, &format!("/v1/kv/key/{key}"));
        let body: ExistedBody = self.json(req).await?;
        Ok(body.existed)
    }

    async fn list_prefix(&self, prefix: &str) -> StateResult<PrefixSnapshot> {
        let req = self
            .request(Method::GET, "/v1/kv/prefix")
            .query(&PrefixQuery {
                prefix: prefix.to_string(),
            });
        self.json(req).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StateResult<LeaseId> {
        let req = self
            .request(Method::POST, "/v1/kv/lease")
            .json(&LeaseGrantBody {
                ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            });
        let body: LeaseBody = self.json(req).await?;
        Ok(body.id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StateResult<()> {
        let req = self.request(Method::POST, &format!("/v1/kv/lease/{lease}/keepalive"));
        let resp = self.send(req, self.timeout).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StateError::LeaseNotFound(lease));
        }
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StateResult<()> {
        let req = self.request(Method::DELETE, &format!("/v1/kv/lease/{lease}"));
        let resp = self.send(req, self.timeout).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StateError::LeaseNotFound(lease));
        }
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> StateResult<Option<String>> {
        let req = self
            .request(Method::POST, "/v1/kv/put-if-absent")
            .json(&PutIfAbsentBody {
                key: key.to_string(),
                value: value.to_string(),
                lease,
            });
        let body: ExistingBody = self.json(req).await?;
        Ok(body.existing)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StateResult<bool> {
        let req = self
            .request(Method::POST, "/v1/kv/delete-if-equals")
            .json(&DeleteIfEqualsBody {
                key: key.to_string(),
                expected: expected.to_string(),
            });
        let body: ExistedBody = self.json(req).await?;
        Ok(body.existed)
    }

    async fn put_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        key: &str,
        value: &str,
    ) -> StateResult<bool> {
        let req = self
            .request(Method::POST, "/v1/kv/put-if-equals")
            .json(&PutIfEqualsBody {
                guard_key: guard_key.to_string(),
                expected: expected.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        let body: WrittenBody = self.json(req).await?;
        Ok(body.written)
    }

    async fn events_since(&self, revision: u64, wait: Duration) -> StateResult<EventBatch> {
        // The server holds the request for up to `wait`.
        let timeout = wait + self.timeout;
        let req = self
            .request(Method::GET, "/v1/kv/events")
            .query(&EventsQuery {
                since: revision,
                wait_ms: wait.as_millis() as u64,
            })
            .timeout(timeout);
        let resp = self.send(req, timeout).await?;
        let batch: EventBatch = resp
            .json()
            .await
            .map_err(|e| StateError::Deserialize(e.to_string()))?;
        debug!(since = revision, events = batch.events.len(), "events polled");
        Ok(batch)
    }
}
