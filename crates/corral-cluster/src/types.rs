//! Payloads exchanged over the cluster management API.

use serde::{Deserialize, Serialize};

use corral_state::{ClusterMember, Remote, Role};

use crate::error::{ClusterError, ClusterResult, ErrorKind};

/// Body of `POST /cluster`: a node asking to be admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub name: String,
    pub address: String,
    /// PEM-encoded server certificate of the joining node.
    pub certificate: String,
    pub secret: String,
    pub schema_version: u64,
}

impl JoinRequest {
    /// Reject payloads that cannot describe a member.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.name.trim().is_empty() {
            return Err(ClusterError::BadRequest("member name must not be empty".into()));
        }
        if self.name.contains('/') {
            return Err(ClusterError::BadRequest(format!(
                "member name {:?} must not contain '/'",
                self.name
            )));
        }
        validate_address(&self.address)?;
        if self.certificate.trim().is_empty() {
            return Err(ClusterError::BadRequest("certificate must not be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(ClusterError::BadRequest("join secret must not be empty".into()));
        }
        Ok(())
    }

    pub fn to_remote(&self) -> Remote {
        Remote {
            name: self.name.clone(),
            address: self.address.clone(),
            certificate: self.certificate.clone(),
        }
    }
}

/// `host:port` with a non-empty host and a numeric port.
fn validate_address(address: &str) -> ClusterResult<()> {
    let invalid = || ClusterError::BadRequest(format!("address {address:?} is not host:port"));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

/// A member as the joining node should trust it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMemberLocal {
    pub name: String,
    pub address: String,
    pub certificate: String,
}

impl From<Remote> for ClusterMemberLocal {
    fn from(remote: Remote) -> Self {
        Self {
            name: remote.name,
            address: remote.address,
            certificate: remote.certificate,
        }
    }
}

impl From<ClusterMemberLocal> for Remote {
    fn from(member: ClusterMemberLocal) -> Self {
        Self {
            name: member.name,
            address: member.address,
            certificate: member.certificate,
        }
    }
}

/// Response to a successful join. Never persisted by the issuer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    /// PEM-encoded cluster certificate.
    pub cluster_cert: String,
    /// PEM-encoded cluster private key.
    pub cluster_key: String,
    pub cluster_members: Vec<ClusterMemberLocal>,
}

/// Best-effort reachability of a member, as seen by the lister.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Online,
    NotResponding,
}

/// External view of a cluster member returned by `GET /cluster`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMemberView {
    pub name: String,
    pub address: String,
    pub certificate: String,
    pub role: Role,
    pub schema_version: u64,
    pub last_heartbeat: u64,
    pub status: MemberStatus,
}

impl From<ClusterMember> for ClusterMemberView {
    fn from(member: ClusterMember) -> Self {
        Self {
            name: member.name,
            address: member.address,
            certificate: member.certificate,
            role: member.role,
            schema_version: member.schema_version,
            last_heartbeat: member.heartbeat,
            status: MemberStatus::NotResponding,
        }
    }
}

/// Structured error carried in a failed response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// JSON envelope wrapping every management API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &ClusterError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.message().to_string(),
            }),
        }
    }

    /// Unwrap the envelope into the payload or the carried error.
    pub fn into_result(self) -> ClusterResult<Option<T>> {
        match (self.success, self.error) {
            (true, _) => Ok(self.data),
            (false, Some(body)) => Err(ClusterError::from_parts(body.kind, body.message)),
            (false, None) => Err(ClusterError::Internal(
                "peer reported failure without an error body".into(),
            )),
        }
    }
}
