//! Removal orchestration.
//!
//! Removal touches two systems of record on the leader: the replicated
//! member metadata and the consensus membership. The metadata record is
//! deleted first, then the consensus node. A crash between the two
//! leaves a consensus node without a metadata record; the reconciler
//! finds such nodes by address and retries the consensus removal, and a
//! repeated `Remove` call tolerates the already-deleted record.

use std::sync::Arc;

use tracing::{debug, info};

use corral_state::{Remote, Role};

use crate::consensus::{ConsensusNode, ConsensusRole};
use crate::context::{ClusterContext, REMOVE_TIMEOUT};
use crate::error::{ClusterError, ClusterResult};
use crate::restart::{ResetTicket, SelfRemovalHold};

/// What the caller must do after a successful removal.
#[derive(Debug)]
pub enum RemovalOutcome {
    /// The leader performed the removal on our behalf. When this node
    /// removed itself, `hold` keeps the restart gate closed and must live
    /// until the response has been delivered.
    Forwarded { hold: Option<SelfRemovalHold> },
    /// A remote member was removed and told to reset.
    Removed,
    /// This node removed itself as leader and must restart once the
    /// response has been delivered.
    RestartRequested(ResetTicket),
}

pub struct RemovalOrchestrator {
    ctx: Arc<ClusterContext>,
}

impl RemovalOrchestrator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    pub async fn remove(&self, name: &str) -> ClusterResult<RemovalOutcome> {
        let all_remotes = self.ctx.trust.remotes_by_name();
        let target = all_remotes.get(name).cloned().ok_or_else(|| {
            ClusterError::NotFound(format!("no remote exists with the given name {name:?}"))
        })?;
        let survivors: Vec<Remote> = all_remotes
            .into_values()
            .filter(|r| r.name != name)
            .collect();

        let leader = self.ctx.leader_within(REMOVE_TIMEOUT).await?;
        let removing_self = target.address == self.ctx.address();

        if leader.address != self.ctx.address() {
            // Taken before forwarding: the leader's reset instruction back to
            // this node must not be actioned until our caller has its answer.
            let hold = if removing_self {
                Some(self.ctx.supervisor.gate().hold_self_removal(name).await)
            } else {
                None
            };

            debug!(member = %name, leader = %leader.address, "forwarding removal to leader");
            self.ctx
                .peers
                .delete_cluster_member(&leader.address, name)
                .await?;
            self.ctx.trust.replace(survivors)?;
            return Ok(RemovalOutcome::Forwarded { hold });
        }

        let nodes = self.ctx.consensus.cluster().await?;
        let node = nodes
            .iter()
            .find(|n| n.address == target.address)
            .cloned()
            .ok_or_else(|| {
                ClusterError::NotFound(format!(
                    "no consensus member exists with the given name {name:?}"
                ))
            })?;

        self.check_quorum(&nodes).await?;

        if nodes.len() == 2 && target.address == leader.address {
            self.hand_off_voters(&nodes, &leader).await?;
        }

        let address = node.address.clone();
        self.ctx
            .database
            .transaction(|tx| {
                if tx.cluster_member_by_address(&address)?.is_some() {
                    tx.delete_cluster_member(&address)?;
                }
                Ok::<_, ClusterError>(())
            })
            .await?;
        self.ctx.consensus.remove(node.id).await?;
        info!(member = %name, address = %node.address, "member removed from cluster");

        if removing_self {
            let ticket = self.ctx.supervisor.arm_reset().await?;
            return Ok(RemovalOutcome::RestartRequested(ticket));
        }

        self.ctx.trust.replace(survivors)?;
        self.ctx
            .peers
            .reset_cluster_member(&target.address, name)
            .await?;
        Ok(RemovalOutcome::Removed)
    }

    /// Refuse removals that would leave no working quorum.
    async fn check_quorum(&self, nodes: &[ConsensusNode]) -> ClusterResult<()> {
        let members = self
            .ctx
            .database
            .transaction(|tx| Ok::<_, ClusterError>(tx.cluster_members()?))
            .await?;
        // The target is still counted, so a two-member cluster may drop
        // either member; the voter handoff below covers losing the leader.
        let non_pending = members.iter().filter(|m| m.role != Role::Pending).count();

        if non_pending < 2 {
            return Err(ClusterError::QuorumViolation(
                "cannot remove cluster members, there are no remaining non-pending members".into(),
            ));
        }
        if nodes.len() < 2 {
            return Err(ClusterError::QuorumViolation(format!(
                "cannot leave a cluster with {} members",
                nodes.len()
            )));
        }
        Ok(())
    }

    /// Make every other node a voter before the leader of a two-node
    /// cluster removes itself.
    async fn hand_off_voters(
        &self,
        nodes: &[ConsensusNode],
        leader: &ConsensusNode,
    ) -> ClusterResult<()> {
        for node in nodes.iter().filter(|n| n.address != leader.address) {
            debug!(address = %node.address, "assigning voter before leader removal");
            self.ctx.consensus.assign(node.id, ConsensusRole::Voter).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::consensus::node_id_for;
    use crate::restart::Delivery;
    use crate::testing::{ConsensusCall, MemoryConsensus, PeerCall, TestNode, member, remote};

    const A: &str = "10.0.0.1:7443";
    const B: &str = "10.0.0.2:7443";
    const C: &str = "10.0.0.3:7443";

    /// A node at `local` in a cluster of `(name, address, role)` members led by `leader`.
    async fn cluster(
        local: (&str, &str),
        members: &[(&str, &str, Role)],
        leader: &str,
    ) -> TestNode {
        let nodes: Vec<(&str, ConsensusRole)> = members
            .iter()
            .filter(|(_, _, role)| *role != Role::Pending)
            .map(|(_, address, role)| {
                let role = match role {
                    Role::StandBy => ConsensusRole::StandBy,
                    Role::Spare => ConsensusRole::Spare,
                    _ => ConsensusRole::Voter,
                };
                (*address, role)
            })
            .collect();
        let consensus = Arc::new(MemoryConsensus::with_nodes(&nodes, Some(leader)));
        let node = TestNode::with_consensus(local.0, local.1, consensus).await;

        let records: Vec<_> = members
            .iter()
            .filter(|(_, address, _)| *address != local.1)
            .map(|(name, address, role)| member(name, address, *role))
            .collect();
        node.ctx
            .database
            .transaction(|tx| {
                for record in records {
                    tx.create_cluster_member(record)?;
                }
                Ok::<_, ClusterError>(())
            })
            .await
            .unwrap();
        for (name, address, _) in members {
            node.ctx.trust.add(remote(name, address)).unwrap();
        }
        node
    }

    #[tokio::test]
    async fn unknown_name_is_not_found_without_mutation() {
        let node = cluster(("a", A), &[("a", A, Role::Voter), ("b", B, Role::Voter)], A).await;

        let err = RemovalOrchestrator::new(node.ctx.clone())
            .remove("ghost")
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::NotFound(_)));
        assert_eq!(node.ctx.trust.count(), 2);
        assert_eq!(node.ctx.database.store().list_members().unwrap().len(), 2);
        assert!(node.consensus.calls().is_empty());
    }

    #[tokio::test]
    async fn trusted_but_not_in_consensus_is_not_found() {
        let node = cluster(("a", A), &[("a", A, Role::Voter), ("b", B, Role::Voter)], A).await;
        node.ctx.trust.add(remote("c", C)).unwrap();

        let err = RemovalOrchestrator::new(node.ctx.clone())
            .remove("c")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::NotFound("no consensus member exists with the given name \"c\"".into())
        );
    }

    #[tokio::test]
    async fn single_non_pending_member_cannot_remove() {
        let node = cluster(("a", A), &[("a", A, Role::Voter), ("b", B, Role::Pending)], A).await;
        // Pending members are not consensus nodes; make b one so the lookup succeeds.
        node.consensus.add_node(B, ConsensusRole::StandBy);

        let err = RemovalOrchestrator::new(node.ctx.clone())
            .remove("b")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::QuorumViolation(
                "cannot remove cluster members, there are no remaining non-pending members".into()
            )
        );
        assert_eq!(node.ctx.database.store().list_members().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn single_consensus_node_cannot_leave() {
        let node = cluster(("a", A), &[("a", A, Role::Voter), ("b", B, Role::Voter)], A).await;
        // b's metadata record still counts, so only the consensus check fires.
        node.consensus.drop_node(B);

        let err = RemovalOrchestrator::new(node.ctx.clone())
            .remove("a")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::QuorumViolation("cannot leave a cluster with 1 members".into())
        );
    }

    #[tokio::test]
    async fn two_node_leader_removal_assigns_voter_first() {
        let node = cluster(
            ("a", A),
            &[("a", A, Role::Voter), ("b", B, Role::StandBy)],
            A,
        )
        .await;

        let outcome = RemovalOrchestrator::new(node.ctx.clone())
            .remove("a")
            .await
            .unwrap();
        assert!(matches!(outcome, RemovalOutcome::RestartRequested(_)));

        let calls = node.consensus.calls();
        let assign = calls
            .iter()
            .position(|c| *c == ConsensusCall::Assign { id: node_id_for(B), role: ConsensusRole::Voter })
            .expect("survivor was not made a voter");
        let remove = calls
            .iter()
            .position(|c| *c == ConsensusCall::Remove { id: node_id_for(A) })
            .expect("leader was not removed");
        assert!(assign < remove);
        assert!(node.consensus.is_stopped());
    }

    #[tokio::test]
    async fn three_node_removal_updates_trust_and_resets_target() {
        let node = cluster(
            ("a", A),
            &[("a", A, Role::Voter), ("b", B, Role::Voter), ("c", C, Role::Voter)],
            A,
        )
        .await;

        let outcome = RemovalOrchestrator::new(node.ctx.clone())
            .remove("b")
            .await
            .unwrap();

        assert!(matches!(outcome, RemovalOutcome::Removed));
        assert_eq!(node.consensus.nodes().len(), 2);
        assert!(node.ctx.trust.by_name("b").is_none());
        assert!(node.ctx.database.store().get_member(B).unwrap().is_none());
        assert_eq!(
            node.peers.calls(),
            vec![PeerCall::Reset {
                address: B.into(),
                name: "b".into()
            }]
        );
        assert!(
            !node
                .consensus
                .calls()
                .iter()
                .any(|c| matches!(c, ConsensusCall::Assign { .. }))
        );
    }

    #[tokio::test]
    async fn removal_retries_after_metadata_already_deleted() {
        let node = cluster(
            ("a", A),
            &[("a", A, Role::Voter), ("b", B, Role::Voter), ("c", C, Role::Voter)],
            A,
        )
        .await;
        node.ctx
            .database
            .transaction(|tx| tx.delete_cluster_member(B))
            .await
            .unwrap();

        let outcome = RemovalOrchestrator::new(node.ctx.clone())
            .remove("b")
            .await
            .unwrap();
        assert!(matches!(outcome, RemovalOutcome::Removed));
        assert!(node.consensus.nodes().iter().all(|n| n.address != B));
    }

    #[tokio::test]
    async fn follower_self_removal_holds_gate_while_forwarding() {
        let node = cluster(
            ("b", B),
            &[("a", A, Role::Voter), ("b", B, Role::Voter), ("c", C, Role::Voter)],
            A,
        )
        .await;
        let gate = node.ctx.supervisor.gate().clone();
        node.peers.on_delete(move |_, _| {
            assert!(gate.is_held(), "gate must be held before forwarding");
            Ok(())
        });

        let outcome = RemovalOrchestrator::new(node.ctx.clone())
            .remove("b")
            .await
            .unwrap();

        let RemovalOutcome::Forwarded { hold: Some(hold) } = outcome else {
            panic!("expected a forwarded self-removal with a hold");
        };
        assert!(node.ctx.trust.by_name("b").is_none());
        assert!(node.ctx.supervisor.gate().is_held());
        drop(hold);
        assert!(!node.ctx.supervisor.gate().is_held());
    }

    #[tokio::test]
    async fn follower_forward_failure_releases_gate_and_keeps_trust() {
        let node = cluster(
            ("b", B),
            &[("a", A, Role::Voter), ("b", B, Role::Voter)],
            A,
        )
        .await;
        node.peers.on_delete(|_, _| {
            Err(ClusterError::QuorumViolation("cannot leave a cluster with 1 members".into()))
        });

        let err = RemovalOrchestrator::new(node.ctx.clone())
            .remove("b")
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::QuorumViolation(_)));
        assert!(!node.ctx.supervisor.gate().is_held());
        assert!(node.ctx.trust.by_name("b").is_some());
    }

    #[tokio::test]
    async fn leader_self_removal_restarts_after_delivery() {
        let node = cluster(
            ("a", A),
            &[("a", A, Role::Voter), ("b", B, Role::Voter), ("c", C, Role::Voter)],
            A,
        )
        .await;

        let outcome = RemovalOrchestrator::new(node.ctx.clone())
            .remove("a")
            .await
            .unwrap();
        let RemovalOutcome::RestartRequested(ticket) = outcome else {
            panic!("expected a restart request");
        };
        assert_eq!(node.replacer.count(), 0);

        ticket.deliver(Delivery::Flushed);
        node.replacer.wait(Duration::from_secs(1)).await;
        assert_eq!(node.replacer.count(), 1);
    }
}
