//! Raft RPC endpoints.
//!
//! Answers the requests sent by [`crate::network`]: each handler hands
//! the decoded request to openraft and returns its `Result` as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tracing::debug;

use crate::network::{APPEND_PATH, SNAPSHOT_PATH, VOTE_PATH};
use crate::typ::{CorralRaft, TypeConfig};

/// Routes serving raft RPCs for `raft`.
pub fn raft_router(raft: Arc<CorralRaft>) -> Router {
    Router::new()
        .route(APPEND_PATH, post(append_entries))
        .route(VOTE_PATH, post(vote))
        .route(SNAPSHOT_PATH, post(install_snapshot))
        .with_state(raft)
}

async fn append_entries(
    State(raft): State<Arc<CorralRaft>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<u64>, RaftError<u64>>> {
    debug!(
        term = req.vote.leader_id().term,
        entries = req.entries.len(),
        "handling append_entries rpc"
    );
    Json(raft.append_entries(req).await)
}

async fn vote(
    State(raft): State<Arc<CorralRaft>>,
    Json(req): Json<VoteRequest<u64>>,
) -> Json<Result<VoteResponse<u64>, RaftError<u64>>> {
    debug!(term = req.vote.leader_id().term, "handling vote rpc");
    Json(raft.vote(req).await)
}

async fn install_snapshot(
    State(raft): State<Arc<CorralRaft>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>>> {
    debug!(
        snapshot_id = %req.meta.snapshot_id,
        offset = req.offset,
        "handling install_snapshot rpc"
    );
    Json(raft.install_snapshot(req).await)
}
