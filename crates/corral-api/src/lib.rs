//! corral-api: HTTP surface of a corral member.
//!
//! # API Routes
//!
//! | Method | Path | Access | Description |
//! |---|---|---|---|
//! | POST | `/cluster` | open | Join the cluster with a token secret |
//! | GET | `/cluster` | trusted | List members with liveness status |
//! | PUT | `/cluster/{name}` | trusted | Reset this member (sent by the leader) |
//! | DELETE | `/cluster/{name}` | trusted | Remove a member |
//! | GET | `/ready` | open | Liveness probe |
//!
//! "Trusted" routes accept requests from the local control socket and
//! requests signed with the cluster key by a trusted member (see
//! [`access`]). Internal routes handed to [`build_router`] (raft RPCs)
//! are mounted behind the same access check.

pub mod access;
pub mod completion;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};

use corral_cluster::ClusterContext;

pub use access::{ControlSocket, with_control_socket};
pub use completion::{Completion, CompletionBody};
pub use error::ApiError;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ClusterContext>,
}

/// Build the complete API router, guarding `internal` like the trusted routes.
pub fn build_router(ctx: Arc<ClusterContext>, internal: Router) -> Router {
    let state = ApiState { ctx };
    let guard = middleware::from_fn_with_state(state.clone(), access::require_trusted);

    let cluster = post(handlers::join_cluster)
        .merge(get(handlers::list_cluster_members).route_layer(guard.clone()));
    let member = put(handlers::reset_cluster_member)
        .delete(handlers::remove_cluster_member)
        .route_layer(guard.clone());

    Router::new()
        .route("/cluster", cluster)
        .route("/cluster/{name}", member)
        .route("/ready", get(handlers::ready))
        .with_state(state)
        .merge(internal.route_layer(guard))
}
