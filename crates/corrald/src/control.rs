//! Local control socket.
//!
//! The operator bootstraps a member, or has it join a cluster, through a
//! unix socket in the data directory. Requests arriving on the socket are
//! trusted without identity headers, so the socket file is created
//! readable and writable by the daemon's user only. Once the member holds
//! cluster state the same socket also serves the full cluster API.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use corral_api::ApiError;
use corral_cluster::{ApiResponse, ClusterError, ErrorKind};

use crate::node::Node;

pub const BOOTSTRAP_PATH: &str = "/control/bootstrap";
pub const JOIN_PATH: &str = "/control/join";

/// Body of a join command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinCommand {
    pub via: String,
    pub secret: String,
}

/// What the member looks like after a successful command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipStatus {
    pub name: String,
    pub address: String,
    /// Members in the local trust store, this one included.
    pub trusted: usize,
}

/// Routes for the membership commands.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route(BOOTSTRAP_PATH, post(bootstrap))
        .route(JOIN_PATH, post(join))
        .with_state(node)
}

fn api_error(err: anyhow::Error) -> ApiError {
    let kind = err
        .downcast_ref::<ClusterError>()
        .map_or(ErrorKind::Internal, ClusterError::kind);
    ApiError(ClusterError::from_parts(kind, format!("{err:#}")))
}

async fn bootstrap(State(node): State<Arc<Node>>) -> Result<Json<ApiResponse<MembershipStatus>>, ApiError> {
    let was_member = node.is_member();
    node.bootstrap().await.map_err(api_error)?;
    if !was_member {
        node.membership_gained();
    }
    Ok(Json(ApiResponse::ok(node.status())))
}

async fn join(
    State(node): State<Arc<Node>>,
    Json(command): Json<JoinCommand>,
) -> Result<Json<ApiResponse<MembershipStatus>>, ApiError> {
    if node.is_member() {
        return Err(ApiError(ClusterError::Conflict(format!(
            "{} already belongs to a cluster",
            node.name()
        ))));
    }
    node.join(&command.via, &command.secret).await.map_err(api_error)?;
    node.membership_gained();
    Ok(Json(ApiResponse::ok(node.status())))
}

/// Bind the control socket, replacing a stale socket file.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove stale control socket {}", path.display()));
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict control socket {}", path.display()))?;
    info!(path = %path.display(), "control socket listening");
    Ok(listener)
}

/// Operator side of the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub async fn bootstrap(&self) -> anyhow::Result<MembershipStatus> {
        self.call(BOOTSTRAP_PATH, &()).await
    }

    pub async fn join(&self, via: &str, secret: &str) -> anyhow::Result<MembershipStatus> {
        let command = JoinCommand {
            via: via.to_string(),
            secret: secret.to_string(),
        };
        self.call(JOIN_PATH, &command).await
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> anyhow::Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let stream = UnixStream::connect(&self.socket).await.with_context(|| {
            format!("failed to reach corrald on {}; is it running?", self.socket.display())
        })?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "control connection closed with error");
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(http::header::HOST, "localhost")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(serde_json::to_vec(body)?)))?;
        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();

        let envelope: ApiResponse<T> = serde_json::from_slice(&bytes).with_context(|| {
            format!("corrald answered {status}: {}", String::from_utf8_lossy(&bytes))
        })?;
        envelope
            .into_result()?
            .ok_or_else(|| anyhow!("corrald answered {status} without a result"))
    }
}
