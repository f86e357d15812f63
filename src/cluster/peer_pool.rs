//! Peer connection pool (§4.4).
//!
//! One gRPC channel per peer node ID, shared by every component that talks
//! to that peer (Raft transport, forwarders, broadcaster, search). Lazily
//! dials on first use via `Endpoint::connect_lazy` — the same pattern the
//! teacher's `raft::GrpcNetwork::get_client` uses so heartbeats never block
//! on a TCP handshake. Map mutations go through one `dashmap` shard lock;
//! the lock is never held across the network I/O of an actual RPC.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Channel;

use crate::cluster::store::NodeId;
use crate::cluster::tls::TlsHolder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RPC_TIMEOUT: Duration = Duration::from_secs(4);

/// Resolves cluster membership to `(node_id, advertise_addr)` pairs.
/// Implemented by `ConfigStore` over the live Raft membership; kept as a
/// trait so the pool can be unit tested with a static peer list.
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<(NodeId, String)>;
    fn self_id(&self) -> NodeId;
}

struct PeerEntry {
    addr: String,
    channel: Channel,
    /// Bumped on every redial; lets a caller holding a stale `Channel` tell
    /// it apart from the current one without comparing by address.
    generation: u64,
}

/// One pooled gRPC channel per peer, keyed by node ID.
pub struct PeerPool {
    entries: dashmap::DashMap<NodeId, PeerEntry>,
    tls: Arc<TlsHolder>,
    directory: Arc<dyn PeerDirectory>,
}

impl PeerPool {
    pub fn new(tls: Arc<TlsHolder>, directory: Arc<dyn PeerDirectory>) -> Arc<Self> {
        Arc::new(Self {
            entries: dashmap::DashMap::new(),
            tls,
            directory,
        })
    }

    /// All cluster members except self, as currently known to Raft.
    pub fn peers(&self) -> Vec<(NodeId, String)> {
        let self_id = self.directory.self_id();
        self.directory
            .peers()
            .into_iter()
            .filter(|(id, _)| *id != self_id)
            .collect()
    }

    /// Lazily dial (or reuse) the channel for `node_id`. Returns an error if
    /// the node's address is not present in the current Raft membership.
    pub fn conn(&self, node_id: NodeId) -> Result<Channel, String> {
        let addr = self
            .directory
            .peers()
            .into_iter()
            .find(|(id, _)| *id == node_id)
            .map(|(_, addr)| addr)
            .ok_or_else(|| format!("unknown peer node id {node_id}"))?;

        if let Some(entry) = self.entries.get(&node_id) {
            if entry.addr == addr {
                return Ok(entry.channel.clone());
            }
        }

        let channel = self.dial(&addr)?;
        let generation = self
            .entries
            .get(&node_id)
            .map(|e| e.generation + 1)
            .unwrap_or(0);
        self.entries.insert(
            node_id,
            PeerEntry {
                addr,
                channel: channel.clone(),
                generation,
            },
        );
        Ok(channel)
    }

    /// Close and drop the cached entry for `node_id`, forcing a redial on
    /// the next `conn` call (e.g. after an RPC error).
    pub fn invalidate(&self, node_id: NodeId) {
        self.entries.remove(&node_id);
    }

    pub fn close(&self) {
        self.entries.clear();
    }

    fn dial(&self, addr: &str) -> Result<Channel, String> {
        let endpoint = self
            .tls
            .dial_endpoint(addr, CONNECT_TIMEOUT, RPC_TIMEOUT)
            .map_err(|e| e.to_string())?;

        // connect_lazy never blocks on the handshake; tonic dials on first
        // RPC and transparently reconnects on transport-level failure.
        Ok(endpoint.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory {
        self_id: NodeId,
        peers: Vec<(NodeId, String)>,
    }

    impl PeerDirectory for StaticDirectory {
        fn peers(&self) -> Vec<(NodeId, String)> {
            self.peers.clone()
        }
        fn self_id(&self) -> NodeId {
            self.self_id
        }
    }

    fn pool_with(self_id: NodeId, peers: Vec<(NodeId, String)>) -> Arc<PeerPool> {
        PeerPool::new(
            Arc::new(TlsHolder::empty()),
            Arc::new(StaticDirectory { self_id, peers }),
        )
    }

    #[test]
    fn peers_excludes_self() {
        let pool = pool_with(
            1,
            vec![
                (1, "a:1".into()),
                (2, "b:1".into()),
                (3, "c:1".into()),
            ],
        );
        let peers = pool.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|(id, _)| *id != 1));
    }

    #[test]
    fn conn_fails_for_unknown_peer() {
        let pool = pool_with(1, vec![(1, "a:1".into())]);
        assert!(pool.conn(99).is_err());
    }

    #[test]
    fn conn_lazily_dials_and_caches() {
        let pool = pool_with(1, vec![(1, "a:1".into()), (2, "127.0.0.1:9000".into())]);
        let first = pool.conn(2).unwrap();
        let second = pool.conn(2).unwrap();
        // connect_lazy channels are cheap handles; both calls should reuse
        // the same cached entry rather than dialing twice.
        assert_eq!(pool.entries.len(), 1);
        drop((first, second));
    }

    #[test]
    fn invalidate_forces_redial_bump() {
        let pool = pool_with(1, vec![(1, "a:1".into()), (2, "127.0.0.1:9000".into())]);
        pool.conn(2).unwrap();
        pool.invalidate(2);
        assert!(pool.entries.get(&2).is_none());
        pool.conn(2).unwrap();
        assert_eq!(pool.entries.get(&2).unwrap().generation, 0);
    }

    #[test]
    fn close_clears_all_entries() {
        let pool = pool_with(1, vec![(1, "a:1".into()), (2, "127.0.0.1:9000".into())]);
        pool.conn(2).unwrap();
        pool.close();
        assert!(pool.entries.is_empty());
    }
}
