//! `gastrologd` — the GastroLog cluster node binary (§4).
//!
//! Resolves node configuration from CLI flags/environment, bootstraps or
//! joins the cluster's TLS trust (§4.2), starts the Raft-backed config
//! store and gRPC plane (§4.3, §4.10), and serves until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{error, info, warn};

use gastrolog_core::cluster::certs::{self, GeneratedCa};
use gastrolog_core::cluster::config::ClusterConfig;
use gastrolog_core::cluster::enroll::LocalEnrollHandler;
use gastrolog_core::cluster::join_client;
use gastrolog_core::cluster::proto::{broadcast_message::Payload, BroadcastMessage, NodeStats};
use gastrolog_core::cluster::server::ClusterServer;
use gastrolog_core::cluster::store::node_id_from_str;
use gastrolog_core::cluster::tls::TlsEnvelope;
use gastrolog_core::cluster::Cluster;

/// GastroLog cluster node: Raft config store + mTLS record/gossip plane.
#[derive(Parser, Debug)]
#[command(name = "gastrologd")]
struct Cli {
    /// Stable node identity (defaults to $GASTROLOG_NODE_ID, then $HOSTNAME).
    #[arg(long, env = "GASTROLOG_NODE_ID")]
    node_id: Option<String>,

    /// Address this node binds its cluster port on.
    #[arg(long, env = "GASTROLOG_CLUSTER_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Address advertised to peers (defaults to the bound address).
    #[arg(long, env = "GASTROLOG_CLUSTER_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// Directory holding persisted TLS material and Raft state.
    #[arg(long, env = "GASTROLOG_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address of an existing member to enroll with. Omit to bootstrap a
    /// new cluster (generates its own CA).
    #[arg(long, env = "GASTROLOG_JOIN_ADDR")]
    join_addr: Option<String>,

    /// Join token issued by the cluster being joined.
    #[arg(long, env = "GASTROLOG_JOIN_TOKEN")]
    join_token: Option<String>,

    /// Path to the CA certificate PEM the operator distributed alongside
    /// the join token (required when `--join-addr` is set — see
    /// `cluster::join_client` for why this is needed ahead of trust).
    #[arg(long, env = "GASTROLOG_JOIN_CA_CERT")]
    join_ca_cert: Option<PathBuf>,

    /// `node-id=host:port` pairs seeding initial Raft membership on first
    /// boot (ignored on later boots — membership already exists).
    #[arg(long = "peer", env = "GASTROLOG_PEERS", value_delimiter = ',')]
    peers: Vec<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

fn resolve_config(cli: &Cli) -> ClusterConfig {
    let mut config = ClusterConfig::from_env();
    if let Some(v) = &cli.node_id {
        config.node_id = v.clone();
    }
    if let Some(v) = &cli.bind_addr {
        config.bind_addr = v.clone();
    }
    if cli.advertise_addr.is_some() {
        config.advertise_addr = cli.advertise_addr.clone();
    }
    if let Some(v) = &cli.data_dir {
        config.data_dir = v.clone();
    }
    if cli.join_addr.is_some() {
        config.join_addr = cli.join_addr.clone();
    }
    if cli.join_token.is_some() {
        config.join_token = cli.join_token.clone();
    }
    config
}

fn parse_peers(raw: &[String]) -> Result<Vec<(u64, String)>, String> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .map(|s| {
            let (id, addr) = s
                .split_once('=')
                .ok_or_else(|| format!("invalid --peer entry '{s}', expected node-id=host:port"))?;
            Ok((node_id_from_str(id), addr.to_string()))
        })
        .collect()
}

/// Strips a trailing `:port`, if any, so the remainder is SAN-eligible.
fn host_only(addr: &str) -> String {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr).to_string()
}

/// Loads persisted TLS material if present; otherwise bootstraps a new CA
/// or enrolls with `--join-addr`, then persists what results. Idempotent —
/// safe to call on every boot.
async fn ensure_tls_material(config: &ClusterConfig, cli: &Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if TlsEnvelope::load_from(&config.data_dir)?.is_some() {
        info!("found persisted cluster TLS material, skipping bootstrap/join");
        return Ok(());
    }

    let envelope = match (&config.join_addr, &config.join_token) {
        (Some(join_addr), Some(join_token)) => {
            let ca_cert_path = cli
                .join_ca_cert
                .as_ref()
                .ok_or("--join-ca-cert is required when --join-addr is set")?;
            let bootstrap_ca_pem = std::fs::read_to_string(ca_cert_path)?;

            info!(join_addr, "enrolling with existing cluster member");
            join_client::enroll(join_addr, &bootstrap_ca_pem, join_token, &config.node_id, &advertise_hint(config))
                .await
                .map_err(|e| format!("enrollment failed: {e}"))?
        }
        (Some(_), None) => return Err("--join-addr requires --join-token".into()),
        _ => {
            info!("no join target configured, bootstrapping a new cluster CA");
            let ca = certs::generate_ca()?;
            let extra_sans = vec![host_only(&advertise_hint(config))];
            let node_cert = certs::generate_cluster_cert(&ca, &extra_sans)?;
            certs::persist_ca_key(&config.data_dir, &ca.key_pem)?;
            TlsEnvelope {
                ca_cert_pem: ca.cert_pem,
                cluster_cert_pem: node_cert.cert_pem,
                cluster_key_pem: node_cert.key_pem,
            }
        }
    };

    envelope.persist_to(&config.data_dir)?;
    Ok(())
}

fn advertise_hint(config: &ClusterConfig) -> String {
    config.advertise_addr.clone().unwrap_or_else(|| config.bind_addr.clone())
}

/// Builds an `EnrollHandler` for nodes holding the CA's private key (the
/// bootstrap node, or a node restored from its data dir) and mints a fresh
/// join token for the operator to hand the next joiner. Nodes that joined
/// by enrollment never receive the CA key, so they return `None` — only a
/// CA holder can accept new members.
fn build_enroll_handler(data_dir: &Path, ca_cert_pem: &str) -> Result<Option<(LocalEnrollHandler, String)>, Box<dyn std::error::Error + Send + Sync>> {
    let Some(ca_key_pem) = certs::load_ca_key(data_dir)? else {
        return Ok(None);
    };
    let ca = GeneratedCa::from_pem(ca_cert_pem, &ca_key_pem)?;
    let join_token = certs::generate_join_token(&ca)?;
    let parsed = certs::JoinToken::parse(&join_token).expect("just-generated token parses");
    Ok(Some((LocalEnrollHandler::new(ca, parsed.secret), join_token)))
}

fn node_stats_message(node_id: &str, started_at: Instant) -> BroadcastMessage {
    let timestamp_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    BroadcastMessage {
        sender_id: node_id.to_string(),
        timestamp_unix_ms,
        payload: Some(Payload::NodeStats(NodeStats {
            cpu_pct: 0.0,
            mem_bytes: 0,
            disk_bytes: 0,
            ingest_rate: 0.0,
            uptime_secs: started_at.elapsed().as_secs(),
        })),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli);
    let peers = parse_peers(&cli.peers)?;
    let node_id = node_id_from_str(&config.node_id);

    ensure_tls_material(&config, &cli).await?;

    let cluster = Cluster::start(config.clone(), node_id, peers).await?;

    match build_enroll_handler(&config.data_dir, &cluster.tls.envelope()?.ca_cert_pem) {
        Ok(Some((handler, join_token))) => {
            info!(%join_token, "this node can accept new members; join token minted above");
            cluster.server.set_enroll_handler(Arc::new(handler));
        }
        Ok(None) => info!("this node does not hold the cluster CA key; it cannot accept new members"),
        Err(e) => warn!(error = %e, "failed to build enroll handler, new members cannot join through this node"),
    }

    let server_task = {
        let server = cluster.server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!(error = %e, "cluster server exited");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let broadcaster_task = {
        let broadcaster = cluster.broadcaster.clone();
        let interval = config.broadcast_interval;
        let node_id_str = cluster.config.node_id.clone();
        let started_at = Instant::now();
        tokio::spawn(broadcaster.run(interval, shutdown_rx, move || node_stats_message(&node_id_str, started_at)))
    };

    info!(node_id = %cluster.config.node_id, addr = %cluster.server.bound_addr(), "gastrologd running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    cluster.server.stop();
    let _ = shutdown_tx.send(true);

    let abort_handle = server_task.abort_handle();
    match tokio::time::timeout(ClusterServer::drain_deadline(), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "cluster server exited with error during drain"),
        Ok(Err(e)) => error!(error = %e, "cluster server task panicked during drain"),
        Err(_) => {
            warn!("drain deadline elapsed, force-stopping cluster server");
            abort_handle.abort();
        }
    }

    let _ = broadcaster_task.await;
    Ok(())
}
