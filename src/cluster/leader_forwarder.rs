//! Leader forwarder for config writes (§4.5).
//!
//! Caches a single gRPC connection to whichever address Raft currently
//! reports as leader. The cached client is keyed by leader address rather
//! than node ID so a leadership change that re-resolves to the same address
//! (restart on the same host) doesn't force a redial. Like the teacher's
//! `GrpcNetwork`, the channel is dialed lazily and reused across calls.

use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::Channel;
use tracing::warn;

use crate::cluster::errors::{ClusterError, ClusterResult};
use crate::cluster::proto::cluster_service_client::ClusterServiceClient;
use crate::cluster::proto::ForwardApplyRequest;
use crate::cluster::tls::TlsHolder;
use std::sync::Arc;

const APPLY_DEADLINE: Duration = Duration::from_secs(10);

struct Cached {
    addr: String,
    channel: Channel,
}

/// Resolves the current Raft leader's advertise address, or `None` if no
/// leader is known. Implemented by `ConfigStore`.
pub trait LeaderResolver: Send + Sync {
    fn leader_addr(&self) -> Option<String>;
}

pub struct LeaderForwarder {
    cached: Mutex<Option<Cached>>,
    tls: Arc<TlsHolder>,
    resolver: Arc<dyn LeaderResolver>,
}

impl LeaderForwarder {
    pub fn new(tls: Arc<TlsHolder>, resolver: Arc<dyn LeaderResolver>) -> Arc<Self> {
        Arc::new(Self {
            cached: Mutex::new(None),
            tls,
            resolver,
        })
    }

    /// Forward a pre-serialised `ConfigCommand` to the current leader via
    /// `ForwardApply`. Fails with `NoLeader` if Raft reports none.
    pub async fn forward(&self, command: Vec<u8>) -> ClusterResult<()> {
        let addr = self
            .resolver
            .leader_addr()
            .ok_or(ClusterError::NoLeader)?;

        let channel = self.channel_for(&addr)?;
        let mut client = ClusterServiceClient::new(channel);

        let mut request = tonic::Request::new(ForwardApplyRequest { command });
        request.set_timeout(APPLY_DEADLINE);

        client.forward_apply(request).await.map_err(|e| {
            self.invalidate();
            ClusterError::Transient(e.to_string())
        })?;
        Ok(())
    }

    fn channel_for(&self, addr: &str) -> ClusterResult<Channel> {
        let mut guard = self.cached.lock().unwrap();
        if let Some(cached) = guard.as_ref() {
            if cached.addr == addr {
                return Ok(cached.channel.clone());
            }
        }

        let endpoint = self
            .tls
            .dial_endpoint(addr, Duration::from_secs(3), APPLY_DEADLINE)
            .map_err(|e| ClusterError::Transient(e.to_string()))?;

        let channel = endpoint.connect_lazy();
        *guard = Some(Cached {
            addr: addr.to_string(),
            channel: channel.clone(),
        });
        Ok(channel)
    }

    fn invalidate(&self) {
        let mut guard = self.cached.lock().unwrap();
        if guard.is_some() {
            warn!("leader forwarder RPC failed, invalidating cached connection");
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLeaderYet;
    impl LeaderResolver for NoLeaderYet {
        fn leader_addr(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn forward_without_known_leader_fails() {
        let forwarder = LeaderForwarder::new(Arc::new(TlsHolder::empty()), Arc::new(NoLeaderYet));
        let result = forwarder.forward(vec![1, 2, 3]).await;
        assert!(matches!(result, Err(ClusterError::NoLeader)));
    }

    struct FixedLeader(String);
    impl LeaderResolver for FixedLeader {
        fn leader_addr(&self) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn channel_for_same_addr_is_cached() {
        let forwarder = LeaderForwarder::new(
            Arc::new(TlsHolder::empty()),
            Arc::new(FixedLeader("127.0.0.1:9100".into())),
        );
        let c1 = forwarder.channel_for("127.0.0.1:9100").unwrap();
        let c2 = forwarder.channel_for("127.0.0.1:9100").unwrap();
        assert_eq!(forwarder.cached.lock().unwrap().as_ref().unwrap().addr, "127.0.0.1:9100");
        drop((c1, c2));
    }

    #[test]
    fn channel_for_new_addr_replaces_cache() {
        let forwarder = LeaderForwarder::new(
            Arc::new(TlsHolder::empty()),
            Arc::new(FixedLeader("127.0.0.1:9100".into())),
        );
        forwarder.channel_for("127.0.0.1:9100").unwrap();
        forwarder.channel_for("127.0.0.1:9200").unwrap();
        assert_eq!(forwarder.cached.lock().unwrap().as_ref().unwrap().addr, "127.0.0.1:9200");
    }
}
