//! Gossip broadcaster (§4.7).
//!
//! Ticks on an interval, reads the current peer set from the shared
//! `PeerPool` (which itself reads Raft membership), and fires a `Broadcast`
//! RPC at each peer concurrently. A single peer's failure never blocks
//! delivery to the others — failures are logged once, then suppressed until
//! the peer recovers, mirroring the teacher's worker-level "log once, don't
//! spam on every tick" pattern used for connection retries in `grpc.rs`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::peer_pool::PeerPool;
use crate::cluster::proto::cluster_service_client::ClusterServiceClient;
use crate::cluster::proto::BroadcastMessage;
use crate::cluster::store::NodeId;

const BROADCAST_DEADLINE: Duration = Duration::from_secs(4);

/// Registry of subscribers notified synchronously on every incoming
/// `Broadcast` RPC (see `ClusterServer::set_broadcast_sink`). Callbacks
/// here MUST NOT block — store to a map or enqueue work.
pub trait BroadcastSubscriber: Send + Sync {
    fn on_broadcast(&self, msg: &BroadcastMessage);
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Arc<dyn BroadcastSubscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, subscriber: Arc<dyn BroadcastSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    pub fn dispatch(&self, msg: &BroadcastMessage) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber.on_broadcast(msg);
        }
    }
}

/// Sends this node's gossip messages to every other peer on a tick.
pub struct Broadcaster {
    pool: Arc<PeerPool>,
    node_id: NodeId,
    /// Peers currently failing; suppresses repeat warnings until recovery.
    failing: Mutex<HashSet<NodeId>>,
}

impl Broadcaster {
    pub fn new(pool: Arc<PeerPool>, node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            pool,
            node_id,
            failing: Mutex::new(HashSet::new()),
        })
    }

    /// Runs the gossip loop until `shutdown` fires. `message_fn` builds a
    /// fresh `BroadcastMessage` for each tick (so e.g. stats stay current).
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        message_fn: impl Fn() -> BroadcastMessage + Send + 'static,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let msg = message_fn();
                    self.broadcast_once(msg).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Sends `msg` to every peer concurrently, independent of any tick loop.
    pub async fn broadcast_once(&self, msg: BroadcastMessage) {
        let peers = self.pool.peers();
        let sends = peers.into_iter().map(|(peer_id, _addr)| {
            let msg = msg.clone();
            async move {
                self.send_to(peer_id, msg).await;
            }
        });
        futures_join_all(sends).await;
    }

    async fn send_to(&self, peer_id: NodeId, msg: BroadcastMessage) {
        let channel = match self.pool.conn(peer_id) {
            Ok(c) => c,
            Err(e) => {
                self.note_failure(peer_id, &e);
                return;
            }
        };
        let mut client = ClusterServiceClient::new(channel);
        let mut request = tonic::Request::new(msg);
        request.set_timeout(BROADCAST_DEADLINE);

        match client.broadcast(request).await {
            Ok(_) => self.note_recovery(peer_id),
            Err(e) => {
                self.pool.invalidate(peer_id);
                self.note_failure(peer_id, &e);
            }
        }
    }

    fn note_failure(&self, peer_id: NodeId, err: &dyn std::fmt::Display) {
        let mut failing = self.failing.lock().unwrap();
        if failing.insert(peer_id) {
            warn!(peer_id, error = %err, "broadcast to peer failing");
        }
    }

    fn note_recovery(&self, peer_id: NodeId) {
        let mut failing = self.failing.lock().unwrap();
        if failing.remove(&peer_id) {
            info!(peer_id, "broadcast to peer recovered");
        }
    }
}

/// Minimal local stand-in for `futures::future::join_all` so the broadcaster
/// doesn't need the full `futures` crate for one call site.
async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let futures: Vec<_> = iter.into_iter().collect();
    for fut in futures {
        fut.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::peer_pool::PeerDirectory;
    use crate::cluster::tls::TlsHolder;

    struct NoPeers;
    impl PeerDirectory for NoPeers {
        fn peers(&self) -> Vec<(NodeId, String)> {
            Vec::new()
        }
        fn self_id(&self) -> NodeId {
            1
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_is_a_noop() {
        let pool = PeerPool::new(Arc::new(TlsHolder::empty()), Arc::new(NoPeers));
        let broadcaster = Broadcaster::new(pool, 1);
        broadcaster
            .broadcast_once(BroadcastMessage {
                sender_id: "1".into(),
                timestamp_unix_ms: 0,
                payload: None,
            })
            .await;
    }

    struct OnePeer;
    impl PeerDirectory for OnePeer {
        fn peers(&self) -> Vec<(NodeId, String)> {
            vec![(2, "127.0.0.1:1".into())]
        }
        fn self_id(&self) -> NodeId {
            1
        }
    }

    #[tokio::test]
    async fn unreachable_peer_is_marked_failing() {
        // connect_lazy never blocks, so `pool.conn` succeeds; the RPC
        // itself then fails since nothing is listening on the address.
        let pool = PeerPool::new(Arc::new(TlsHolder::empty()), Arc::new(OnePeer));
        let broadcaster = Broadcaster::new(pool, 1);
        broadcaster
            .broadcast_once(BroadcastMessage {
                sender_id: "1".into(),
                timestamp_unix_ms: 0,
                payload: None,
            })
            .await;
        assert!(broadcaster.failing.lock().unwrap().contains(&2));
    }
}
