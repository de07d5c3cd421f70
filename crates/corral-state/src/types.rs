//! Domain types for the corral state stores.
//!
//! `ClusterMember` and `TokenRecord` live in the replicated metadata
//! tables; `Remote` is the local trust-store entry. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ── Cluster members ────────────────────────────────────────────────

/// Participation role of a cluster member.
///
/// `Pending` means admitted to the metadata store but not yet a
/// consensus participant. The other roles mirror the consensus layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pending,
    Voter,
    StandBy,
    Spare,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "pending",
            Role::Voter => "voter",
            Role::StandBy => "stand_by",
            Role::Spare => "spare",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the cluster as recorded in the replicated metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterMember {
    pub name: String,
    /// `host:port` the member serves its API on. Unique across members.
    pub address: String,
    /// PEM-encoded server certificate.
    pub certificate: String,
    pub schema_version: u64,
    /// Unix timestamp (seconds) of the last observed heartbeat; 0 = never.
    pub heartbeat: u64,
    pub role: Role,
}

impl ClusterMember {
    pub fn table_key(&self) -> &str {
        &self.address
    }

    /// The trust-store view of this member.
    pub fn to_remote(&self) -> Remote {
        Remote {
            name: self.name.clone(),
            address: self.address.clone(),
            certificate: self.certificate.clone(),
        }
    }
}

// ── Tokens ─────────────────────────────────────────────────────────

/// Single-use proof that a join request is authorized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    /// Name of the member the token was issued for.
    pub name: String,
    pub secret: String,
    /// Unix timestamp (seconds) after which the token is void; 0 = never.
    pub expires_at: u64,
}

impl TokenRecord {
    pub fn table_key(&self) -> &str {
        &self.name
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }
}

// ── Trust store ────────────────────────────────────────────────────

/// A trusted peer identity, persisted locally. One per known peer, self included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub address: String,
    /// PEM-encoded server certificate.
    pub certificate: String,
}

// ── Write batches ──────────────────────────────────────────────────

/// A single write against the metadata tables.
///
/// Transactions buffer these and commit them as one atomic batch, either
/// locally or through the consensus log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    PutMember { member: ClusterMember },
    DeleteMember { address: String },
    PutToken { token: TokenRecord },
    DeleteToken { name: String },
}

/// Full contents of the metadata tables, used for consensus snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataSnapshot {
    pub members: Vec<ClusterMember>,
    pub tokens: Vec<TokenRecord>,
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
