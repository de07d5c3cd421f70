//! Background reconciliation of the three systems of record.
//!
//! Membership changes update the replicated metadata, the consensus
//! membership and each member's trust store separately, so any of them
//! can lag behind after a partial failure. Each pass converges them:
//!
//! 1. every member whose own record exists mirrors the member set into
//!    its trust store;
//! 2. on the leader, consensus nodes without a member record are removed;
//! 3. on the leader, pending members are added to consensus as stand-by;
//! 4. on the leader, stand-bys are promoted until three voters exist;
//! 5. on the leader, member records take the role consensus reports,
//!    with a fresh heartbeat.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use corral_state::{ClusterMember, Remote, Role};

use crate::consensus::{ConsensusNode, ConsensusRole, node_id_for};
use crate::context::{ClusterContext, JOIN_TIMEOUT};
use crate::error::{ClusterError, ClusterResult};

/// Number of voters the reconciler promotes stand-bys towards.
pub const TARGET_VOTERS: usize = 3;

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub trust_synced: bool,
    /// Addresses removed from consensus for lack of a member record.
    pub orphans_removed: Vec<String>,
    /// Addresses of pending members added to consensus.
    pub pending_added: Vec<String>,
    /// Addresses promoted to voter.
    pub promoted: Vec<String>,
    /// Names of member records whose role was updated.
    pub roles_updated: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    ctx: Arc<ClusterContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    /// Reconcile on every tick and whenever nudged, until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        let nudge = self.ctx.reconcile.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = nudge.notified() => {}
                _ = shutdown.changed() => break,
            }
            match self.run_once().await {
                Ok(report) if !report.is_empty() => info!(?report, "reconciled cluster membership"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "membership reconciliation failed"),
            }
        }
        debug!("reconciler stopped");
    }

    pub async fn run_once(&self) -> ClusterResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let members = self
            .ctx
            .database
            .transaction(|tx| Ok::<_, ClusterError>(tx.cluster_members()?))
            .await?;

        report.trust_synced = self.sync_trust(&members)?;

        let leader = match tokio::time::timeout(JOIN_TIMEOUT, self.ctx.consensus.leader()).await {
            Ok(leader) => leader?,
            Err(_) => {
                debug!("no leader known, skipping consensus reconciliation");
                return Ok(report);
            }
        };
        if leader.address != self.ctx.address() {
            return Ok(report);
        }

        let by_address: BTreeMap<&str, &ClusterMember> =
            members.iter().map(|m| (m.address.as_str(), m)).collect();
        let mut nodes = self.ctx.consensus.cluster().await?;

        for node in &nodes {
            if node.address != self.ctx.address() && !by_address.contains_key(node.address.as_str()) {
                self.ctx.consensus.remove(node.id).await?;
                info!(address = %node.address, "removed consensus node without member record");
                report.orphans_removed.push(node.address.clone());
            }
        }
        nodes.retain(|n| !report.orphans_removed.contains(&n.address));

        for member in members.iter().filter(|m| m.role == Role::Pending) {
            if nodes.iter().any(|n| n.address == member.address) {
                continue;
            }
            let id = node_id_for(&member.address);
            self.ctx.consensus.add(id, &member.address).await?;
            info!(member = %member.name, address = %member.address, "added pending member to consensus");
            nodes.push(ConsensusNode {
                id,
                address: member.address.clone(),
                role: ConsensusRole::StandBy,
            });
            report.pending_added.push(member.address.clone());
        }

        let mut voters = nodes.iter().filter(|n| n.role == ConsensusRole::Voter).count();
        let mut standbys: Vec<(&str, &mut ConsensusNode)> = nodes
            .iter_mut()
            .filter(|n| n.role == ConsensusRole::StandBy)
            .filter_map(|n| {
                let name = by_address.get(n.address.as_str())?.name.as_str();
                Some((name, n))
            })
            .collect();
        standbys.sort_by(|a, b| a.0.cmp(b.0));
        for (name, node) in standbys {
            if voters >= TARGET_VOTERS {
                break;
            }
            self.ctx.consensus.assign(node.id, ConsensusRole::Voter).await?;
            info!(member = %name, address = %node.address, "promoted stand-by to voter");
            node.role = ConsensusRole::Voter;
            voters += 1;
            report.promoted.push(node.address.clone());
        }

        report.roles_updated = self.sync_roles(&members, &nodes).await?;
        Ok(report)
    }

    /// Mirror the member set into the trust store, once this node is a member.
    fn sync_trust(&self, members: &[ClusterMember]) -> ClusterResult<bool> {
        if !members.iter().any(|m| m.address == self.ctx.address()) {
            return Ok(false);
        }
        let desired: BTreeMap<String, Remote> = members
            .iter()
            .map(|m| (m.name.clone(), m.to_remote()))
            .collect();
        if desired == self.ctx.trust.remotes_by_name() {
            return Ok(false);
        }
        self.ctx.trust.replace(desired.into_values().collect())?;
        info!(remotes = self.ctx.trust.count(), "trust store synced with cluster members");
        Ok(true)
    }

    async fn sync_roles(
        &self,
        members: &[ClusterMember],
        nodes: &[ConsensusNode],
    ) -> ClusterResult<Vec<String>> {
        let now = corral_state::epoch_secs();
        let updates: Vec<ClusterMember> = members
            .iter()
            .filter_map(|m| {
                let node = nodes.iter().find(|n| n.address == m.address)?;
                let role = node.role.as_member_role();
                (m.role != role).then(|| ClusterMember {
                    role,
                    heartbeat: now,
                    ..m.clone()
                })
            })
            .collect();
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<String> = updates.iter().map(|m| m.name.clone()).collect();
        self.ctx
            .database
            .transaction(|tx| {
                for member in updates {
                    // A concurrent removal may have deleted the record.
                    if tx.cluster_member_by_address(&member.address)?.is_some() {
                        tx.update_cluster_member(member)?;
                    }
                }
                Ok::<_, ClusterError>(())
            })
            .await?;
        Ok(names)
    }
}
