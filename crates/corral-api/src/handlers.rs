//! Cluster membership handlers.
//!
//! Each handler drives one control-plane component and answers with an
//! [`ApiResponse`] envelope.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use tracing::info;

use corral_cluster::{
    ApiResponse, ClusterError, ClusterMemberLocal, ClusterMemberView, JoinCoordinator,
    JoinRequest, MembershipReporter, RemovalOrchestrator, RemovalOutcome, TokenResponse,
};

use crate::ApiState;
use crate::completion::{Completion, tracked};
use crate::error::ApiError;

/// POST /cluster
pub async fn join_cluster(
    State(state): State<ApiState>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let Json(request) =
        payload.map_err(|e| ClusterError::BadRequest(format!("invalid join request: {e}")))?;
    let response = JoinCoordinator::new(state.ctx).join(request).await?;
    Ok(Json(ApiResponse::ok(response)))
}

/// GET /cluster
pub async fn list_cluster_members(
    State(state): State<ApiState>,
) -> Result<Json<ApiResponse<Vec<ClusterMemberView>>>, ApiError> {
    let members = MembershipReporter::new(state.ctx).list().await?;
    Ok(Json(ApiResponse::ok(members)))
}

/// DELETE /cluster/{name}
pub async fn remove_cluster_member(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let removed = state.ctx.trust.by_name(&name).map(ClusterMemberLocal::from);
    let outcome = RemovalOrchestrator::new(state.ctx.clone()).remove(&name).await?;
    let response = Json(ApiResponse::ok(removed)).into_response();

    Ok(match outcome {
        RemovalOutcome::Forwarded { hold: Some(hold) } => tracked(response, Completion::Hold(hold)),
        RemovalOutcome::Forwarded { hold: None } | RemovalOutcome::Removed => response,
        RemovalOutcome::RestartRequested(ticket) => tracked(response, Completion::Reset(ticket)),
    })
}

/// PUT /cluster/{name}
///
/// Wipes local state now and restarts once this response is delivered.
pub async fn reset_cluster_member(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if name != state.ctx.name() {
        return Err(ClusterError::BadRequest(format!(
            "reset instruction for {name:?} reached member {:?}",
            state.ctx.name()
        ))
        .into());
    }

    info!(member = %name, "resetting after removal from cluster");
    let ticket = state.ctx.supervisor.arm_reset().await?;
    let response = Json(ApiResponse::<()> {
        success: true,
        data: None,
        error: None,
    })
    .into_response();
    Ok(tracked(response, Completion::Reset(ticket)))
}

/// GET /ready
pub async fn ready() -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        success: true,
        data: None,
        error: None,
    })
}
