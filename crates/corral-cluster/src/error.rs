//! Error taxonomy for cluster membership operations.
//!
//! Every failure surfaced to an API caller carries a machine-readable
//! [`ErrorKind`] plus a human-readable message naming the violated
//! precondition.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use corral_state::StateError;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Machine-distinguishable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    InvalidToken,
    NotFound,
    Unavailable,
    QuorumViolation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidToken => "invalid_token",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::QuorumViolation => "quorum_violation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the join, list, removal, and reset operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Malformed payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Duplicate address or name.
    #[error("{0}")]
    Conflict(String),

    /// Unknown, expired, or already-consumed join secret.
    #[error("invalid join token: {0}")]
    InvalidToken(String),

    /// Unknown member, in the trust store or at the consensus layer.
    #[error("{0}")]
    NotFound(String),

    /// Leader undiscoverable in time, or a peer could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The removal would leave the cluster without a working quorum.
    #[error("{0}")]
    QuorumViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::BadRequest(_) => ErrorKind::BadRequest,
            ClusterError::Conflict(_) => ErrorKind::Conflict,
            ClusterError::InvalidToken(_) => ErrorKind::InvalidToken,
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::Unavailable(_) => ErrorKind::Unavailable,
            ClusterError::QuorumViolation(_) => ErrorKind::QuorumViolation,
            ClusterError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            ClusterError::BadRequest(m)
            | ClusterError::Conflict(m)
            | ClusterError::InvalidToken(m)
            | ClusterError::NotFound(m)
            | ClusterError::Unavailable(m)
            | ClusterError::QuorumViolation(m)
            | ClusterError::Internal(m) => m,
        }
    }

    /// Rebuild an error from its wire form (kind + message).
    pub fn from_parts(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::BadRequest => ClusterError::BadRequest(message),
            ErrorKind::Conflict => ClusterError::Conflict(message),
            ErrorKind::InvalidToken => ClusterError::InvalidToken(message),
            ErrorKind::NotFound => ClusterError::NotFound(message),
            ErrorKind::Unavailable => ClusterError::Unavailable(message),
            ErrorKind::QuorumViolation => ClusterError::QuorumViolation(message),
            ErrorKind::Internal => ClusterError::Internal(message),
        }
    }
}

impl From<StateError> for ClusterError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(m) => ClusterError::Conflict(m),
            StateError::NotFound(m) => ClusterError::NotFound(m),
            other => ClusterError::Internal(other.to_string()),
        }
    }
}
