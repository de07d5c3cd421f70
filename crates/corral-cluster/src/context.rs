//! Shared runtime context for the control-plane components.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use corral_state::{Database, Remote, TrustStore};

use crate::consensus::{Consensus, ConsensusNode};
use crate::error::{ClusterError, ClusterResult};
use crate::peer::PeerClient;
use crate::restart::Supervisor;
use crate::tls::CertKeyPair;

/// Bound on leader discovery while admitting a member.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on leader discovery while removing a member.
pub const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the join, list, remove, and reset paths share on one node.
pub struct ClusterContext {
    /// This member, as peers should trust it.
    pub local: Remote,
    /// Shared cluster certificate handed to joining members.
    pub cluster_cert: CertKeyPair,
    pub database: Arc<Database>,
    pub trust: Arc<TrustStore>,
    pub consensus: Arc<dyn Consensus>,
    pub peers: Arc<dyn PeerClient>,
    pub supervisor: Supervisor,
    /// Wakes the reconciler ahead of its next scheduled pass.
    pub reconcile: Arc<Notify>,
}

impl ClusterContext {
    pub fn name(&self) -> &str {
        &self.local.name
    }

    pub fn address(&self) -> &str {
        &self.local.address
    }

    /// The current leader, or `Unavailable` if none is known within `timeout`.
    pub async fn leader_within(&self, timeout: Duration) -> ClusterResult<ConsensusNode> {
        match tokio::time::timeout(timeout, self.consensus.leader()).await {
            Ok(leader) => leader,
            Err(_) => Err(ClusterError::Unavailable(format!(
                "no consensus leader found within {timeout:?}"
            ))),
        }
    }
}
