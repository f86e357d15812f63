//! Cluster fabric: mTLS peer plane, Raft-backed config store, record
//! forwarding and gossip (§4).

pub mod broadcaster;
pub mod certs;
pub mod config;
pub mod enroll;
pub mod errors;
pub mod join_client;
pub mod leader_forwarder;
pub mod peer_cache;
pub mod peer_pool;
pub mod proto;
pub mod raft_network;
pub mod record_forwarder;
pub mod search_forwarder;
pub mod server;
pub mod store;
pub mod tls;

use std::sync::Arc;

use tracing::info;

use crate::cluster::broadcaster::{Broadcaster, SubscriberRegistry};
use crate::cluster::config::ClusterConfig;
use crate::cluster::peer_cache::{JobsCache, StatsCache};
use crate::cluster::peer_pool::PeerPool;
use crate::cluster::record_forwarder::RecordForwarder;
use crate::cluster::proto::BroadcastMessage;
use crate::cluster::search_forwarder::SearchForwarder;
use crate::cluster::server::{BroadcastSink, ClusterServer};
use crate::cluster::store::{start_raft_node, ConfigStore};
use crate::cluster::tls::{TlsEnvelope, TlsHolder};

/// Bridges `ClusterServer`'s single `BroadcastSink` injection point to the
/// broadcaster's multi-subscriber registry.
struct SubscriberSink(Arc<SubscriberRegistry>);

impl BroadcastSink for SubscriberSink {
    fn handle_broadcast(&self, msg: BroadcastMessage) {
        self.0.dispatch(&msg);
    }
}

/// Every long-lived cluster component for one node, wired together and
/// handed to `main.rs`. Construction order: bind the server (so the
/// advertise address is known), load or bootstrap TLS, start Raft (which
/// builds the shared `PeerPool`), then build the components that share
/// that pool.
pub struct Cluster {
    pub config: ClusterConfig,
    pub server: Arc<ClusterServer>,
    pub tls: Arc<TlsHolder>,
    pub store: Arc<ConfigStore>,
    pub pool: Arc<PeerPool>,
    pub record_forwarder: Arc<RecordForwarder>,
    pub search_forwarder: Arc<SearchForwarder>,
    pub broadcaster: Arc<Broadcaster>,
    pub stats_cache: Arc<StatsCache>,
    pub jobs_cache: Arc<JobsCache>,
    pub subscribers: Arc<SubscriberRegistry>,
}

impl Cluster {
    /// `peers` seeds initial Raft membership on first boot only; `node_id`
    /// is this node's numeric Raft ID (see `store::node_id_from_str`).
    pub async fn start(
        config: ClusterConfig,
        node_id: u64,
        peers: Vec<(u64, String)>,
    ) -> std::io::Result<Arc<Self>> {
        let tls = Arc::new(TlsHolder::empty());
        if let Some(envelope) = TlsEnvelope::load_from(&config.data_dir)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
        {
            tls.load(envelope);
            info!("loaded persisted cluster TLS material");
        }

        let server = ClusterServer::bind(&config.bind_addr, tls.clone()).await?;
        info!(addr = %server.bound_addr(), "cluster server bound");

        let (store, pool) = start_raft_node(
            node_id,
            config.node_id.clone(),
            peers,
            tls.clone(),
        )
        .await;
        server.set_store(store.clone());

        let record_forwarder = RecordForwarder::new(pool.clone());
        let search_forwarder = SearchForwarder::new(pool.clone());
        let broadcaster = Broadcaster::new(pool.clone(), node_id);

        let stats_cache = Arc::new(StatsCache::new(config.peer_cache_ttl));
        let jobs_cache = Arc::new(JobsCache::new(config.peer_cache_ttl));
        let subscribers = SubscriberRegistry::new();
        subscribers.register(stats_cache.clone());
        subscribers.register(jobs_cache.clone());
        server.set_broadcast_sink(Arc::new(SubscriberSink(subscribers.clone())));

        Ok(Arc::new(Self {
            config,
            server,
            tls,
            store,
            pool,
            record_forwarder,
            search_forwarder,
            broadcaster,
            stats_cache,
            jobs_cache,
            subscribers,
        }))
    }
}
