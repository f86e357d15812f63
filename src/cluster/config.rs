//! Cluster configuration parsed from environment variables.
//!
//! Grounded on the teacher's `cluster::ClusterConfig::from_env` — same
//! "every field has a default, `for_testing()` builds a usable instance"
//! shape, adapted to the GastroLog node-identity / TLS-material / join
//! fields this crate actually needs.

use std::time::Duration;

/// Static configuration for a single cluster node, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Stable node identity used in Raft membership and peer addressing.
    pub node_id: String,

    /// Address this node binds its cluster (Raft + gRPC) port on.
    pub bind_addr: String,

    /// Address advertised to peers (defaults to `bind_addr`; set explicitly
    /// when behind NAT or when `bind_addr` uses `:0` for ephemeral ports in
    /// tests).
    pub advertise_addr: Option<String>,

    /// Directory holding the persisted TLS envelope and Raft log.
    pub data_dir: std::path::PathBuf,

    /// Address of an existing cluster member to enroll with, if joining.
    pub join_addr: Option<String>,

    /// Join token issued by the cluster being joined (`<hex-secret>:<hex-sha256(ca)>`).
    pub join_token: Option<String>,

    /// Interval between gossip broadcast ticks.
    pub broadcast_interval: Duration,

    /// TTL applied to peer-state cache entries (stats/jobs).
    pub peer_cache_ttl: Duration,
}

impl ClusterConfig {
    /// Parse configuration from environment variables, falling back to
    /// sensible defaults so the struct is always constructable.
    pub fn from_env() -> Self {
        let node_id = std::env::var("GASTROLOG_NODE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string())
        });

        let bind_addr = std::env::var("GASTROLOG_CLUSTER_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7420".to_string());

        let advertise_addr = std::env::var("GASTROLOG_CLUSTER_ADVERTISE_ADDR").ok();

        let data_dir = std::env::var("GASTROLOG_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/gastrolog".to_string())
            .into();

        let join_addr = std::env::var("GASTROLOG_JOIN_ADDR").ok();
        let join_token = std::env::var("GASTROLOG_JOIN_TOKEN").ok();

        let broadcast_interval = std::env::var("GASTROLOG_BROADCAST_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(5));

        Self {
            node_id,
            bind_addr,
            advertise_addr,
            data_dir,
            join_addr,
            join_token,
            broadcast_interval,
            peer_cache_ttl: broadcast_interval * 3,
        }
    }

    /// Build a config suitable for unit/integration tests: ephemeral port,
    /// a fresh temp data dir, no join target.
    #[cfg(any(test, feature = "test-support"))]
    pub fn for_testing(node_id: impl Into<String>, data_dir: std::path::PathBuf) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_addr: None,
            data_dir,
            join_addr: None,
            join_token: None,
            broadcast_interval: Duration::from_millis(50),
            peer_cache_ttl: Duration::from_millis(150),
        }
    }

    /// The address peers should use to reach this node.
    pub fn effective_advertise_addr(&self, bound: std::net::SocketAddr) -> String {
        self.advertise_addr.clone().unwrap_or_else(|| bound.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_cache_ttl_is_three_times_broadcast_interval() {
        let cfg = ClusterConfig::for_testing("n1", std::env::temp_dir());
        assert_eq!(cfg.peer_cache_ttl, cfg.broadcast_interval * 3);
    }

    #[test]
    fn advertise_addr_falls_back_to_bound_addr() {
        let cfg = ClusterConfig::for_testing("n1", std::env::temp_dir());
        let bound: std::net::SocketAddr = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(cfg.effective_advertise_addr(bound), "127.0.0.1:7777");
    }
}
