//! scalegrid-api — REST API for scalegrid.
//!
//! Two routers live here. [`build_router`] is the operator surface every
//! control-plane node serves; [`store_router`] exposes a [`StateStore`]
//! over HTTP so nodes on other hosts can share it through `RemoteStore`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/policies` | List scaling policies |
//! | POST | `/api/v1/policies` | Create or replace a policy |
//! | GET | `/api/v1/policies/{id}` | Get a policy |
//! | DELETE | `/api/v1/policies/{id}` | Delete a policy and its run state |
//! | GET | `/api/v1/policies/{id}/runstate` | Last evaluation and action |
//! | GET | `/api/v1/silences` | List active silences |
//! | POST | `/api/v1/silences` | Create a silence |
//! | DELETE | `/api/v1/silences/{id}` | Delete a silence |
//! | GET | `/api/v1/members` | This node's view of the cluster |
//! | GET | `/api/v1/owners` | Current policy owners |
//! | GET | `/healthz` | Liveness |
//!
//! # Store Routes
//!
//! | Method | Path |
//! |---|---|
//! | GET, PUT, DELETE | `/v1/kv/key/{*key}` |
//! | GET | `/v1/kv/prefix?prefix=` |
//! | POST | `/v1/kv/lease` |
//! | POST | `/v1/kv/lease/{id}/keepalive` |
//! | DELETE | `/v1/kv/lease/{id}` |
//! | POST | `/v1/kv/put-if-absent` |
//! | POST | `/v1/kv/delete-if-equals` |
//! | POST | `/v1/kv/put-if-equals` |
//! | GET | `/v1/kv/events?since=&wait_ms=` |

pub mod handlers;
pub mod store_service;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use scalegrid_cluster::MembershipView;
use scalegrid_state::{Clock, KvStore, StateStore};
use tokio::sync::watch;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    /// Latest membership view published by the local peer.
    pub membership: watch::Receiver<MembershipView>,
}

/// Build the operator API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/policies",
            get(handlers::list_policies).post(handlers::put_policy),
        )
        .route(
            "/policies/{id}",
            get(handlers::get_policy).delete(handlers::delete_policy),
        )
        .route("/policies/{id}/runstate", get(handlers::get_run_state))
        .route(
            "/silences",
            get(handlers::list_silences).post(handlers::create_silence),
        )
        .route("/silences/{id}", delete(handlers::delete_silence))
        .route("/members", get(handlers::list_members))
        .route("/owners", get(handlers::list_owners))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}

/// Build the coordination-store service router.
pub fn store_router(store: StateStore) -> Router {
    Router::new()
        .route(
            "/v1/kv/key/{*key}",
            get(store_service::get_key)
                .put(store_service::put_key)
                .delete(store_service::delete_key),
        )
        .route("/v1/kv/prefix", get(store_service::list_prefix))
        .route("/v1/kv/lease", post(store_service::grant_lease))
        .route(
            "/v1/kv/lease/{id}/keepalive",
            post(store_service::keep_alive),
        )
        .route("/v1/kv/lease/{id}", delete(store_service::revoke_lease))
        .route("/v1/kv/put-if-absent", post(store_service::put_if_absent))
        .route(
            "/v1/kv/delete-if-equals",
            post(store_service::delete_if_equals),
        )
        .route("/v1/kv/put-if-equals", post(store_service::put_if_equals))
        .route("/v1/kv/events", get(store_service::events))
        .with_state(store)
}
