//! Membership listing with a best-effort liveness overlay.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::context::ClusterContext;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{ClusterMemberView, MemberStatus};

pub struct MembershipReporter {
    ctx: Arc<ClusterContext>,
}

impl MembershipReporter {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    /// All members, each marked online if it answered a readiness probe.
    ///
    /// Probes run concurrently after the read transaction has ended; an
    /// unreachable member never fails the listing.
    pub async fn list(&self) -> ClusterResult<Vec<ClusterMemberView>> {
        let mut views: Vec<ClusterMemberView> = self
            .ctx
            .database
            .transaction(|tx| Ok::<_, ClusterError>(tx.cluster_members()?))
            .await?
            .into_iter()
            .map(ClusterMemberView::from)
            .collect();

        let mut probes = JoinSet::new();
        for (index, view) in views.iter().enumerate() {
            let peers = self.ctx.peers.clone();
            let address = view.address.clone();
            probes.spawn(async move {
                let result = peers.check_ready(&address).await;
                (index, address, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((index, _, Ok(()))) => views[index].status = MemberStatus::Online,
                Ok((_, address, Err(e))) => {
                    warn!(%address, error = %e, "failed to get status of cluster member");
                }
                Err(e) => warn!(error = %e, "liveness probe task failed"),
            }
        }

        self.ctx.reconcile.notify_one();
        Ok(views)
    }
}
