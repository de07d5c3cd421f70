//! Consensus client facade.
//!
//! The control plane never talks to the consensus implementation
//! directly; it consumes this trait. The consensus layer is the
//! authoritative source for "is this node still a quorum participant",
//! which may transiently disagree with the metadata store's
//! `ClusterMember` records.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use corral_state::Role;

use crate::error::ClusterResult;

/// Role of a node inside the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusRole {
    Voter,
    StandBy,
    Spare,
}

impl ConsensusRole {
    /// The metadata role a member in this consensus role should carry.
    pub fn as_member_role(&self) -> Role {
        match self {
            ConsensusRole::Voter => Role::Voter,
            ConsensusRole::StandBy => Role::StandBy,
            ConsensusRole::Spare => Role::Spare,
        }
    }
}

impl fmt::Display for ConsensusRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_member_role(), f)
    }
}

/// A consensus participant as reported live by the consensus layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub id: u64,
    pub address: String,
    pub role: ConsensusRole,
}

/// Deterministic consensus node ID for a member address.
pub fn node_id_for(address: &str) -> u64 {
    let digest = Sha256::digest(address.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Thin contract over the replicated consensus store.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// The current leader. Waits until one is known; callers bound the
    /// wait with their own timeout.
    async fn leader(&self) -> ClusterResult<ConsensusNode>;

    /// Every consensus participant with its current role.
    async fn cluster(&self) -> ClusterResult<Vec<ConsensusNode>>;

    /// Change the role of an existing participant.
    async fn assign(&self, id: u64, role: ConsensusRole) -> ClusterResult<()>;

    /// Remove a participant. Removing an unknown ID succeeds.
    async fn remove(&self, id: u64) -> ClusterResult<()>;

    /// Register a node as a stand-by participant.
    async fn add(&self, id: u64, address: &str) -> ClusterResult<()>;

    /// Stop local participation in consensus.
    async fn stop(&self) -> ClusterResult<()>;
}
