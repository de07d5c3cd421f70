//! Raft network layer over the peer HTTP transport.
//!
//! Each RPC is a JSON `POST` to `/internal/raft/{append,vote,snapshot}`
//! on the target member, carrying the same identity headers as every
//! other peer request. The answer is the JSON form of the target's
//! `Result`, so a raft-level refusal comes back as a remote error while
//! transport failures surface as unreachable.

use http::Method;
use openraft::BasicNode;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use corral_cluster::HttpTransport;

use crate::typ::TypeConfig;

pub const APPEND_PATH: &str = "/internal/raft/append";
pub const VOTE_PATH: &str = "/internal/raft/vote";
pub const SNAPSHOT_PATH: &str = "/internal/raft/snapshot";

/// Factory that creates per-peer connections sharing one transport.
pub struct NetworkFactory {
    transport: HttpTransport,
}

impl NetworkFactory {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

/// RPC sender for a single peer.
pub struct NetworkConnection {
    target: u64,
    addr: String,
    transport: HttpTransport,
}

fn unreachable<E: std::error::Error>(target: u64, addr: &str, msg: impl std::fmt::Display) -> RPCError<u64, BasicNode, E> {
    RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
        "raft rpc to node {target} ({addr}): {msg}"
    ))))
}

impl NetworkConnection {
    async fn rpc<Req, Resp, E>(
        &self,
        path: &str,
        req: &Req,
        option: &RPCOption,
    ) -> Result<Resp, RPCError<u64, BasicNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let body = serde_json::to_vec(req).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        let sent = self.transport.send(Method::POST, &self.addr, path, Some(body));
        let (status, bytes) = match tokio::time::timeout(option.hard_ttl(), sent).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                debug!(target_node = self.target, addr = %self.addr, error = %e, "raft peer unreachable");
                return Err(unreachable(self.target, &self.addr, e));
            }
            Err(_) => {
                return Err(unreachable(
                    self.target,
                    &self.addr,
                    format!("no answer within {:?}", option.hard_ttl()),
                ));
            }
        };

        if !status.is_success() {
            warn!(target_node = self.target, addr = %self.addr, %status, path, "raft peer refused rpc");
            return Err(unreachable(self.target, &self.addr, format!("answered {status}")));
        }

        let result: Result<Resp, E> =
            serde_json::from_slice(&bytes).map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        debug!(target, addr = %node.addr, "creating raft network connection");
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.rpc(APPEND_PATH, &rpc, &option).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        self.rpc(SNAPSHOT_PATH, &rpc, &option).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.rpc(VOTE_PATH, &rpc, &option).await
    }
}
