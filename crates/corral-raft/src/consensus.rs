//! The control plane's view of raft.
//!
//! [`RaftConsensus`] implements the [`Consensus`] facade on top of an
//! openraft instance: voters are openraft voters, stand-by (and spare)
//! members are learners. [`RaftProposer`] routes metadata transactions
//! through the raft log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, ChangeMembers, RaftMetrics};
use tracing::{debug, info};

use corral_cluster::{ClusterError, ClusterResult, Consensus, ConsensusNode, ConsensusRole, HttpTransport};
use corral_state::{Mutation, Proposer, StateError, StateResult, StateStore};

use crate::log_store::LogStore;
use crate::network::NetworkFactory;
use crate::state_machine::StateMachine;
use crate::typ::{CorralRaft, Request};

/// Start the local raft node over `log` and `store`.
pub async fn start_raft(
    node_id: u64,
    log: LogStore,
    store: StateStore,
    transport: HttpTransport,
) -> anyhow::Result<Arc<CorralRaft>> {
    let config = openraft::Config {
        cluster_name: "corral".to_string(),
        heartbeat_interval: 250,
        election_timeout_min: 1000,
        election_timeout_max: 2000,
        snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(1000),
        ..Default::default()
    }
    .validate()?;

    let raft = CorralRaft::new(
        node_id,
        Arc::new(config),
        NetworkFactory::new(transport),
        log,
        StateMachine::new(store),
    )
    .await?;
    debug!(node_id, "raft node started");
    Ok(Arc::new(raft))
}

fn unavailable(what: &str, err: impl std::fmt::Display) -> ClusterError {
    ClusterError::Unavailable(format!("{what}: {err}"))
}

fn nodes_of(metrics: &RaftMetrics<u64, BasicNode>) -> Vec<ConsensusNode> {
    let membership = metrics.membership_config.membership();
    let voters: BTreeSet<u64> = membership.voter_ids().collect();
    membership
        .nodes()
        .map(|(id, node)| ConsensusNode {
            id: *id,
            address: node.addr.clone(),
            role: if voters.contains(id) {
                ConsensusRole::Voter
            } else {
                ConsensusRole::StandBy
            },
        })
        .collect()
}

fn leader_of(metrics: &RaftMetrics<u64, BasicNode>) -> Option<ConsensusNode> {
    let leader = metrics.current_leader?;
    nodes_of(metrics).into_iter().find(|n| n.id == leader)
}

/// [`Consensus`] backed by openraft.
pub struct RaftConsensus {
    raft: Arc<CorralRaft>,
    node_id: u64,
}

impl RaftConsensus {
    pub fn new(raft: Arc<CorralRaft>, node_id: u64) -> Self {
        Self { raft, node_id }
    }

    pub fn raft(&self) -> &Arc<CorralRaft> {
        &self.raft
    }

    /// Form a single-voter cluster around this node. Returns `false` if
    /// the node already belongs to a cluster.
    pub async fn initialize(&self, address: &str) -> ClusterResult<bool> {
        let nodes = BTreeMap::from([(self.node_id, BasicNode::new(address))]);
        match self.raft.initialize(nodes).await {
            Ok(()) => {
                info!(node_id = self.node_id, %address, "initialized single-member consensus");
                Ok(true)
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(false),
            Err(e) => Err(unavailable("failed to initialize consensus", e)),
        }
    }

    async fn change(&self, changes: ChangeMembers<u64, BasicNode>, retain: bool) -> ClusterResult<()> {
        self.raft
            .change_membership(changes, retain)
            .await
            .map_err(|e| unavailable("consensus membership change failed", e))?;
        Ok(())
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn leader(&self) -> ClusterResult<ConsensusNode> {
        let mut metrics = self.raft.metrics();
        loop {
            let known = leader_of(&metrics.borrow());
            if let Some(leader) = known {
                return Ok(leader);
            }
            metrics
                .changed()
                .await
                .map_err(|_| ClusterError::Unavailable("consensus has stopped".into()))?;
        }
    }

    async fn cluster(&self) -> ClusterResult<Vec<ConsensusNode>> {
        Ok(nodes_of(&self.raft.metrics().borrow()))
    }

    async fn assign(&self, id: u64, role: ConsensusRole) -> ClusterResult<()> {
        let current = self
            .cluster()
            .await?
            .into_iter()
            .find(|n| n.id == id)
            .ok_or_else(|| ClusterError::NotFound(format!("no consensus node with id {id}")))?;

        match (current.role, role) {
            (ConsensusRole::Voter, ConsensusRole::Voter) => Ok(()),
            (_, ConsensusRole::Voter) => {
                self.change(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                    .await
            }
            // Demoted voters stay on as learners.
            (ConsensusRole::Voter, _) => {
                self.change(ChangeMembers::RemoveVoters(BTreeSet::from([id])), true)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn remove(&self, id: u64) -> ClusterResult<()> {
        let Some(node) = self.cluster().await?.into_iter().find(|n| n.id == id) else {
            return Ok(());
        };
        let ids = BTreeSet::from([id]);
        if node.role == ConsensusRole::Voter {
            self.change(ChangeMembers::RemoveVoters(ids), false).await?;
        } else {
            self.change(ChangeMembers::RemoveNodes(ids), false).await?;
        }
        info!(id, address = %node.address, "removed consensus node");
        Ok(())
    }

    async fn add(&self, id: u64, address: &str) -> ClusterResult<()> {
        self.raft
            .add_learner(id, BasicNode::new(address), false)
            .await
            .map_err(|e| unavailable("failed to add consensus learner", e))?;
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Internal(format!("failed to stop consensus: {e}")))
    }
}

/// Commits metadata batches through the raft log.
///
/// `client_write` resolves once the leader's state machine has applied
/// the entry, so the batch is visible locally when `propose` returns.
pub struct RaftProposer {
    raft: Arc<CorralRaft>,
}

impl RaftProposer {
    pub fn new(raft: Arc<CorralRaft>) -> Self {
        Self { raft }
    }
}

#[async_trait]
impl Proposer for RaftProposer {
    async fn propose(&self, batch: Vec<Mutation>) -> StateResult<()> {
        let response = self
            .raft
            .client_write(Request { mutations: batch })
            .await
            .map_err(|e| StateError::Proposal(e.to_string()))?;
        debug!(index = response.log_id.index, applied = response.data.applied, "metadata batch committed");
        Ok(())
    }
}

/// Wait until `raft` reports a leader, or fail after `timeout`.
pub async fn wait_for_leader(raft: &CorralRaft, timeout: Duration) -> anyhow::Result<u64> {
    let metrics = raft
        .wait(Some(timeout))
        .metrics(|m| m.current_leader.is_some(), "leader elected")
        .await?;
    metrics
        .current_leader
        .ok_or_else(|| anyhow::anyhow!("no leader after waiting for one"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_cluster::{PeerIdentity, node_id_for};
    use corral_state::{ClusterMember, Database, Role};

    const ADDR: &str = "127.0.0.1:1";

    async fn single() -> (RaftConsensus, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let id = node_id_for(ADDR);
        let transport = HttpTransport::new(PeerIdentity {
            name: "a".into(),
            fingerprint: "f".into(),
        });
        let raft = start_raft(id, LogStore::open_in_memory().unwrap(), store.clone(), transport)
            .await
            .unwrap();
        let consensus = RaftConsensus::new(raft, id);
        assert!(consensus.initialize(ADDR).await.unwrap());
        wait_for_leader(consensus.raft(), Duration::from_secs(10))
            .await
            .unwrap();
        (consensus, store)
    }

    #[tokio::test]
    async fn single_node_leads_itself() {
        let (consensus, _store) = single().await;

        let leader = consensus.leader().await.unwrap();
        assert_eq!(leader.address, ADDR);
        assert_eq!(leader.role, ConsensusRole::Voter);
        assert!(!consensus.initialize(ADDR).await.unwrap());
    }

    #[tokio::test]
    async fn transactions_commit_through_the_log() {
        let (consensus, store) = single().await;
        let database = Database::new(
            store.clone(),
            Arc::new(RaftProposer::new(consensus.raft().clone())),
        );

        database
            .transaction(|tx| {
                tx.create_cluster_member(ClusterMember {
                    name: "a".into(),
                    address: ADDR.into(),
                    certificate: "cert".into(),
                    schema_version: 1,
                    heartbeat: 0,
                    role: Role::Voter,
                })
            })
            .await
            .unwrap();

        assert_eq!(store.get_member(ADDR).unwrap().unwrap().name, "a");
    }

    #[tokio::test]
    async fn learners_are_stand_by_and_removable() {
        let (consensus, _store) = single().await;
        let other = "127.0.0.1:2";
        let id = node_id_for(other);

        consensus.add(id, other).await.unwrap();
        let nodes = consensus.cluster().await.unwrap();
        let learner = nodes.iter().find(|n| n.id == id).unwrap();
        assert_eq!(learner.role, ConsensusRole::StandBy);

        consensus.assign(id, ConsensusRole::Spare).await.unwrap();
        consensus.remove(id).await.unwrap();
        consensus.remove(id).await.unwrap();
        assert_eq!(consensus.cluster().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assigning_an_unknown_node_is_not_found() {
        let (consensus, _store) = single().await;
        let err = consensus.assign(42, ConsensusRole::Voter).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
