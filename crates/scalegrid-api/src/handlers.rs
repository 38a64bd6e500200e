//! REST API handlers.
//!
//! Each handler reads/writes through the shared `KvStore` and returns the
//! `{ success, data, error }` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use scalegrid_cluster::{Member, PeerState};
use scalegrid_state::*;
use serde::Serialize;
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_failure(e: StateError) -> axum::response::Response {
    let status = if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Policies ───────────────────────────────────────────────────

/// GET /api/v1/policies
pub async fn list_policies(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_policies().await {
        Ok(policies) => ApiResponse::ok(policies).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/v1/policies/{id}
pub async fn get_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_policy(&id).await {
        Ok(Some(policy)) => ApiResponse::ok(policy).into_response(),
        Ok(None) => error_response("policy not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_failure(e),
    }
}

/// POST /api/v1/policies
///
/// Creates the policy or replaces it in place. `created_at` survives
/// replacement; `updated_at` is stamped on every write.
pub async fn put_policy(
    State(state): State<ApiState>,
    Json(mut policy): Json<ScalingPolicy>,
) -> impl IntoResponse {
    if let Err(e) = policy.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    let now = state.clock.now_ms();
    let existing = match state.store.get_policy(&policy.id).await {
        Ok(existing) => existing,
        Err(e) => return store_failure(e),
    };
    policy.created_at = existing.as_ref().map_or(now, |p| p.created_at);
    policy.updated_at = now;

    match state.store.put_policy(&policy).await {
        Ok(_) => {
            info!(policy_id = %policy.id, fleet = %policy.fleet, "policy stored");
            let status = if existing.is_some() {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, ApiResponse::ok(policy)).into_response()
        }
        Err(e) => store_failure(e),
    }
}

/// DELETE /api/v1/policies/{id}
pub async fn delete_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_policy(&id).await {
        Ok(true) => {
            info!(policy_id = %id, "policy deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("policy not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_failure(e),
    }
}

/// GET /api/v1/policies/{id}/runstate
pub async fn get_run_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_run_state(&id).await {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("no run state for policy", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_failure(e),
    }
}

// ── Silences ───────────────────────────────────────────────────

/// GET /api/v1/silences
///
/// Expired silences are inert and left out.
pub async fn list_silences(State(state): State<ApiState>) -> impl IntoResponse {
    let now = state.clock.now_ms();
    match state.store.list_silences().await {
        Ok(silences) => {
            let active: Vec<Silence> = silences.into_iter().filter(|s| s.is_active(now)).collect();
            ApiResponse::ok(active).into_response()
        }
        Err(e) => store_failure(e),
    }
}

/// POST /api/v1/silences
pub async fn create_silence(
    State(state): State<ApiState>,
    Json(mut silence): Json<Silence>,
) -> impl IntoResponse {
    if let Err(e) = silence.validate(state.clock.now_ms()) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }
    match state.store.put_silence(&silence).await {
        Ok(_) => {
            info!(silence_id = %silence.id, pattern = %silence.pattern, ttl = %silence.ttl, "silence created");
            (StatusCode::CREATED, ApiResponse::ok(silence)).into_response()
        }
        Err(e) => store_failure(e),
    }
}

/// DELETE /api/v1/silences/{id}
pub async fn delete_silence(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_silence(&id).await {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("silence not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_failure(e),
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// GET /api/v1/members
pub async fn list_members(State(state): State<ApiState>) -> impl IntoResponse {
    let members: Vec<Member> = state.membership.borrow().members().cloned().collect();
    ApiResponse::ok(members)
}

#[derive(Debug, Serialize)]
pub struct OwnerEntry {
    pub policy_id: PolicyId,
    pub owner: NodeId,
}

/// GET /api/v1/owners
pub async fn list_owners(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_locks().await {
        Ok(locks) => {
            let owners: Vec<OwnerEntry> = locks
                .into_iter()
                .map(|(policy_id, owner)| OwnerEntry { policy_id, owner })
                .collect();
            ApiResponse::ok(owners).into_response()
        }
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub node: String,
    pub state: Option<PeerState>,
    pub alive_members: usize,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let view = state.membership.borrow();
    ApiResponse::ok(Health {
        node: view.local_name().to_string(),
        state: view.local().map(|m| m.state),
        alive_members: view.alive().len(),
    })
}
