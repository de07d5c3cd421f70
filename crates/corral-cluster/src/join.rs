//! Join coordination: admitting a new member into the cluster.
//!
//! Only the consensus leader admits members. A follower that receives a
//! join forwards it unchanged to the leader and, once the leader accepts,
//! trusts the new member locally so it can authenticate its requests.

use std::sync::Arc;

use tracing::{debug, info};

use corral_state::{ClusterMember, Role, StateError};

use crate::context::{ClusterContext, JOIN_TIMEOUT};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{ClusterMemberLocal, JoinRequest, TokenResponse};

pub struct JoinCoordinator {
    ctx: Arc<ClusterContext>,
}

impl JoinCoordinator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    /// Admit `request` and hand the new member its initial cluster state.
    pub async fn join(&self, request: JoinRequest) -> ClusterResult<TokenResponse> {
        request.validate()?;

        if self.ctx.trust.by_address(&request.address).is_some() {
            return Err(ClusterError::Conflict(format!(
                "remote with address {:?} exists",
                request.address
            )));
        }

        let leader = self.ctx.leader_within(JOIN_TIMEOUT).await?;
        if leader.address != self.ctx.address() {
            debug!(member = %request.name, leader = %leader.address, "forwarding join to leader");
            let response = self
                .ctx
                .peers
                .add_cluster_member(&leader.address, &request)
                .await?;
            self.ctx.trust.add(request.to_remote())?;
            info!(member = %request.name, address = %request.address, "trusted member admitted by leader");
            return Ok(response);
        }

        self.admit(&request).await?;

        let new_remote = request.to_remote();
        let mut remotes = self.ctx.trust.remotes_by_name();
        remotes.insert(new_remote.name.clone(), new_remote.clone());
        let response = TokenResponse {
            cluster_cert: self.ctx.cluster_cert.cert_pem.clone(),
            cluster_key: self.ctx.cluster_cert.key_pem.clone(),
            cluster_members: remotes.into_values().map(ClusterMemberLocal::from).collect(),
        };

        self.ctx.trust.add(new_remote)?;
        self.ctx.reconcile.notify_one();
        info!(member = %request.name, address = %request.address, "member admitted as pending");
        Ok(response)
    }

    /// Consume the join token and record the member as pending, atomically.
    async fn admit(&self, request: &JoinRequest) -> ClusterResult<()> {
        let member = ClusterMember {
            name: request.name.clone(),
            address: request.address.clone(),
            certificate: request.certificate.clone(),
            schema_version: request.schema_version,
            heartbeat: 0,
            role: Role::Pending,
        };
        let now = corral_state::epoch_secs();

        self.ctx
            .database
            .transaction(|tx| {
                let record = tx.token_record_by_secret(&request.secret).map_err(|e| match e {
                    StateError::NotFound(_) => {
                        ClusterError::InvalidToken("no token record matches the given secret".into())
                    }
                    other => other.into(),
                })?;
                if record.is_expired(now) {
                    return Err(ClusterError::InvalidToken(format!(
                        "join token {:?} has expired",
                        record.name
                    )));
                }

                tx.create_cluster_member(member)?;
                tx.delete_token_record(&record.name)?;
                Ok(())
            })
            .await
    }
}
