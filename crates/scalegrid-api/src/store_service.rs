//! HTTP service for a [`StateStore`], the server side of `RemoteStore`.
//!
//! Replies are the bare wire bodies from `scalegrid_state::kv`; failures
//! carry a [`StoreErrorBody`]. A missing lease is a 404 with
//! `lease_not_found` set so the client can rebuild the typed error.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scalegrid_state::kv::*;
use scalegrid_state::{StateError, StateStore};
use tracing::{debug, warn};

/// Upper bound on a long-poll, whatever the client asks for.
const MAX_WAIT: Duration = Duration::from_secs(60);

fn store_error(e: StateError) -> Response {
    let (status, lease_not_found) = match &e {
        StateError::LeaseNotFound(id) => (StatusCode::NOT_FOUND, Some(*id)),
        e if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    if status.is_server_error() {
        warn!(error = %e, "store request failed");
    }
    (
        status,
        Json(StoreErrorBody {
            error: e.to_string(),
            lease_not_found,
        }),
    )
        .into_response()
}

fn bad_request(msg: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(StoreErrorBody {
            error: msg.to_string(),
            lease_not_found: None,
        }),
    )
        .into_response()
}

// ── Keys ───────────────────────────────────────────────────────

/// GET /v1/kv/key/{*key}
pub async fn get_key(State(store): State<StateStore>, Path(key): Path<String>) -> Response {
    match store.get(&key) {
        Ok(Some(value)) => Json(ValueBody { value }).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(StoreErrorBody {
                error: format!("key {key} not found"),
                lease_not_found: None,
            }),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /v1/kv/key/{*key}
pub async fn put_key(
    State(store): State<StateStore>,
    Path(key): Path<String>,
    Json(body): Json<ValueBody>,
) -> Response {
    match store.put(&key, &body.value) {
        Ok(revision) => Json(RevisionBody { revision }).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /v1/kv/key/{*key}
pub async fn delete_key(State(store): State<StateStore>, Path(key): Path<String>) -> Response {
    match store.delete(&key) {
        Ok(existed) => Json(ExistedBody { existed }).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /v1/kv/prefix?prefix=
pub async fn list_prefix(
    State(store): State<StateStore>,
    Query(query): Query<PrefixQuery>,
) -> Response {
    match store.list_prefix(&query.prefix) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Leases ─────────────────────────────────────────────────────

/// POST /v1/kv/lease
pub async fn grant_lease(
    State(store): State<StateStore>,
    Json(body): Json<LeaseGrantBody>,
) -> Response {
    if body.ttl_ms == 0 {
        return bad_request("lease ttl must be positive");
    }
    match store.grant_lease(Duration::from_millis(body.ttl_ms)) {
        Ok(id) => Json(LeaseBody { id }).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /v1/kv/lease/{id}/keepalive
pub async fn keep_alive(State(store): State<StateStore>, Path(id): Path<LeaseId>) -> Response {
    match store.keep_alive(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /v1/kv/lease/{id}
pub async fn revoke_lease(State(store): State<StateStore>, Path(id): Path<LeaseId>) -> Response {
    match store.revoke_lease(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error(e),
    }
}

// ── Conditional writes ─────────────────────────────────────────

/// POST /v1/kv/put-if-absent
pub async fn put_if_absent(
    State(store): State<StateStore>,
    Json(body): Json<PutIfAbsentBody>,
) -> Response {
    match store.put_if_absent(&body.key, &body.value, body.lease) {
        Ok(existing) => Json(ExistingBody { existing }).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /v1/kv/delete-if-equals
pub async fn delete_if_equals(
    State(store): State<StateStore>,
    Json(body): Json<DeleteIfEqualsBody>,
) -> Response {
    match store.delete_if_equals(&body.key, &body.expected) {
        Ok(existed) => Json(ExistedBody { existed }).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /v1/kv/put-if-equals
pub async fn put_if_equals(
    State(store): State<StateStore>,
    Json(body): Json<PutIfEqualsBody>,
) -> Response {
    match store.put_if_equals(&body.guard_key, &body.expected, &body.key, &body.value) {
        Ok(written) => Json(WrittenBody { written }).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Change feed ────────────────────────────────────────────────

/// GET /v1/kv/events?since=&wait_ms=
pub async fn events(State(store): State<StateStore>, Query(query): Query<EventsQuery>) -> Response {
    let wait = Duration::from_millis(query.wait_ms).min(MAX_WAIT);
    match store.wait_events(query.since, wait).await {
        Ok(batch) => {
            debug!(since = query.since, events = batch.events.len(), compacted = batch.compacted, "events served");
            Json(batch).into_response()
        }
        Err(e) => store_error(e),
    }
}
