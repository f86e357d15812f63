//! Search forwarder (§4.9): synchronous scatter-gather RPCs.
//!
//! Thin wrapper over the peer pool for the five request/response search
//! operations. Each call dials (or reuses) a connection for the target
//! node, issues the RPC under the caller's own deadline, and invalidates
//! the connection before propagating any failure — the same
//! invalidate-on-error discipline `leader_forwarder.rs` and
//! `raft_network.rs` use.

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::errors::{ClusterError, ClusterResult};
use crate::cluster::peer_pool::PeerPool;
use crate::cluster::proto::cluster_service_client::ClusterServiceClient;
use crate::cluster::proto::ScatterRequest;
use crate::cluster::store::NodeId;

pub struct SearchForwarder {
    pool: Arc<PeerPool>,
}

impl SearchForwarder {
    pub fn new(pool: Arc<PeerPool>) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    fn client_for(&self, node_id: NodeId) -> ClusterResult<ClusterServiceClient<tonic::transport::Channel>> {
        let channel = self.pool.conn(node_id).map_err(ClusterError::Transient)?;
        Ok(ClusterServiceClient::new(channel))
    }

    fn request(payload: Vec<u8>, deadline: Duration) -> tonic::Request<ScatterRequest> {
        let mut request = tonic::Request::new(ScatterRequest { payload });
        request.set_timeout(deadline);
        request
    }

    fn on_failure(&self, node_id: NodeId, status: tonic::Status) -> ClusterError {
        self.pool.invalidate(node_id);
        ClusterError::Transient(status.to_string())
    }

    pub async fn search(&self, node_id: NodeId, payload: Vec<u8>, deadline: Duration) -> ClusterResult<Vec<u8>> {
        let mut client = self.client_for(node_id)?;
        client
            .forward_search(Self::request(payload, deadline))
            .await
            .map(|resp| resp.into_inner().payload)
            .map_err(|e| self.on_failure(node_id, e))
    }

    pub async fn get_context(&self, node_id: NodeId, payload: Vec<u8>, deadline: Duration) -> ClusterResult<Vec<u8>> {
        let mut client = self.client_for(node_id)?;
        client
            .forward_get_context(Self::request(payload, deadline))
            .await
            .map(|resp| resp.into_inner().payload)
            .map_err(|e| self.on_failure(node_id, e))
    }

    pub async fn list_chunks(&self, node_id: NodeId, payload: Vec<u8>, deadline: Duration) -> ClusterResult<Vec<u8>> {
        let mut client = self.client_for(node_id)?;
        client
            .forward_list_chunks(Self::request(payload, deadline))
            .await
            .map(|resp| resp.into_inner().payload)
            .map_err(|e| self.on_failure(node_id, e))
    }

    pub async fn get_indexes(&self, node_id: NodeId, payload: Vec<u8>, deadline: Duration) -> ClusterResult<Vec<u8>> {
        let mut client = self.client_for(node_id)?;
        client
            .forward_get_indexes(Self::request(payload, deadline))
            .await
            .map(|resp| resp.into_inner().payload)
            .map_err(|e| self.on_failure(node_id, e))
    }

    pub async fn validate_vault(&self, node_id: NodeId, payload: Vec<u8>, deadline: Duration) -> ClusterResult<Vec<u8>> {
        let mut client = self.client_for(node_id)?;
        client
            .forward_validate_vault(Self::request(payload, deadline))
            .await
            .map(|resp| resp.into_inner().payload)
            .map_err(|e| self.on_failure(node_id, e))
    }
}
