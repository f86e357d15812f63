//! openraft transport over `ClusterService` (§4.3, §4.10).
//!
//! Lifted from the teacher's `raft::GrpcNetwork`/`GrpcNetworkFactory`: same
//! JSON-over-`bytes payload` encoding for `AppendEntries`/`Vote`/
//! `InstallSnapshot`, same lazily-dialed client reused across calls. The
//! only structural change is sourcing the channel from the shared
//! `PeerPool` instead of owning a private one, so Raft traffic and
//! forwarder/broadcast traffic reuse the same per-peer connection.

use std::sync::Arc;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};

use crate::cluster::peer_pool::PeerPool;
use crate::cluster::proto::cluster_service_client::ClusterServiceClient;
use crate::cluster::proto::RaftMessage;
use crate::cluster::store::{NodeId, TypeConfig};

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-target-node Raft network handle, backed by the shared `PeerPool`.
pub struct PooledRaftNetwork {
    target: NodeId,
    pool: Arc<PeerPool>,
}

impl PooledRaftNetwork {
    fn client(&self) -> Result<ClusterServiceClient<tonic::transport::Channel>, String> {
        let channel = self.pool.conn(self.target)?;
        Ok(ClusterServiceClient::new(channel))
    }
}

impl RaftNetwork<TypeConfig> for PooledRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let mut client = self.client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .append_entries(RaftMessage { payload })
            .await
            .map_err(|e| {
                self.pool.invalidate(self.target);
                RPCError::Unreachable(unreachable(e))
            })?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let mut client = self.client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client.vote(RaftMessage { payload }).await.map_err(|e| {
            self.pool.invalidate(self.target);
            RPCError::Unreachable(unreachable(e))
        })?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let mut client = self.client().map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let resp = client
            .install_snapshot(RaftMessage { payload })
            .await
            .map_err(|e| {
                self.pool.invalidate(self.target);
                RPCError::Unreachable(unreachable(e))
            })?;

        serde_json::from_slice(&resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `PooledRaftNetwork` instances per target peer node.
pub struct GrpcNetworkFactory {
    pool: Arc<PeerPool>,
}

impl GrpcNetworkFactory {
    pub fn new(pool: Arc<PeerPool>) -> Self {
        Self { pool }
    }
}

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = PooledRaftNetwork;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        PooledRaftNetwork {
            target,
            pool: self.pool.clone(),
        }
    }
}
