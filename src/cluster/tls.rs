//! Cluster TLS holder (§4.1).
//!
//! Mirrors the `Arc<ArcSwap<T>>` hot-reload pattern `jizhuozhi-hermes` uses
//! for its route table and domain config — a single atomic pointer swapped
//! wholesale on reload, read-mostly callers taking a `Guard` rather than a
//! lock. Before enrollment completes there is no TLS material at all, so
//! `TlsHolder` starts empty and every config derivation returns
//! `TlsError::NotLoaded` until `load` is called.
//!
//! Configs are built from `tonic::transport`'s own `Certificate`/`Identity`
//! wrappers rather than raw `rustls` types — tonic owns the rustls stack
//! under its `tls` feature, and its `ServerTlsConfig::client_auth_optional`
//! is exactly the "verify if given, permit unauthenticated enrollment"
//! policy the cluster server needs.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity, ServerTlsConfig};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls material has not been loaded yet")]
    NotLoaded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("envelope json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("endpoint construction error: {0}")]
    Endpoint(#[from] tonic::transport::Error),
}

/// On-disk envelope persisted under `<data_dir>/tls.json`, written with a
/// write-temp-then-rename so a crash mid-write never leaves a truncated file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsEnvelope {
    pub ca_cert_pem: String,
    pub cluster_cert_pem: String,
    pub cluster_key_pem: String,
}

impl TlsEnvelope {
    pub fn load_from(data_dir: &Path) -> Result<Option<Self>, TlsError> {
        let path = data_dir.join("tls.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Atomic write: serialize to `tls.json.tmp`, fsync, rename over
    /// `tls.json`, mode 0600 (cert private key lives in this file).
    pub fn persist_to(&self, data_dir: &Path) -> Result<(), TlsError> {
        std::fs::create_dir_all(data_dir)?;
        let final_path = data_dir.join("tls.json");
        let tmp_path = data_dir.join("tls.json.tmp");

        let json = serde_json::to_vec_pretty(self)?;
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

/// Atomically swappable TLS holder shared across the cluster server, peer
/// pool, and RaftNetwork. Empty (`None`) until the node is enrolled or has
/// generated its own bootstrap CA.
pub struct TlsHolder {
    state: ArcSwap<Option<TlsEnvelope>>,
}

impl TlsHolder {
    pub fn empty() -> Self {
        Self {
            state: ArcSwap::from_pointee(None),
        }
    }

    pub fn from_envelope(envelope: TlsEnvelope) -> Self {
        let holder = Self::empty();
        holder.load(envelope);
        holder
    }

    pub fn is_loaded(&self) -> bool {
        self.state.load().is_some()
    }

    /// Install new TLS material, replacing whatever was loaded before.
    /// Existing connections keep using their already-negotiated config;
    /// only future handshakes see the new material.
    pub fn load(&self, envelope: TlsEnvelope) {
        self.state.store(Arc::new(Some(envelope)));
    }

    pub fn envelope(&self) -> Result<TlsEnvelope, TlsError> {
        let guard = self.state.load();
        guard.as_ref().clone().ok_or(TlsError::NotLoaded)
    }

    /// Server config accepting (but not requiring) a client certificate —
    /// every RPC except `Enroll` is then gated on a verified chain being
    /// present by an application-level interceptor (see `cluster::server`).
    pub fn server_config(&self) -> Result<ServerTlsConfig, TlsError> {
        let envelope = self.envelope()?;
        let identity = Identity::from_pem(&envelope.cluster_cert_pem, &envelope.cluster_key_pem);
        let ca = Certificate::from_pem(&envelope.ca_cert_pem);
        Ok(ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(ca)
            .client_auth_optional(true))
    }

    /// Client config presenting this node's own cluster cert, trusting only
    /// the cluster CA — used by the peer pool and the join-time enroll call.
    /// `domain_name` is always `"localhost"`: every cluster cert carries it
    /// as a SAN regardless of the peer's literal advertise address.
    pub fn client_config(&self) -> Result<ClientTlsConfig, TlsError> {
        let envelope = self.envelope()?;
        let identity = Identity::from_pem(&envelope.cluster_cert_pem, &envelope.cluster_key_pem);
        let ca = Certificate::from_pem(&envelope.ca_cert_pem);
        Ok(ClientTlsConfig::new()
            .domain_name("localhost")
            .ca_certificate(ca)
            .identity(identity))
    }

    /// The "dynamic credentials" object (§4.1/§9): on every dial, consults
    /// the TLS cell and falls back to an insecure `http://` endpoint while
    /// it's still empty (pre-enrollment), switching to mTLS automatically
    /// the moment `load` installs material — callers never branch on
    /// `is_loaded()` themselves. Shared by the peer pool and the leader
    /// forwarder so the fallback decision lives in exactly one place.
    pub fn dial_endpoint(
        &self,
        addr: &str,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Result<Endpoint, TlsError> {
        let loaded = self.is_loaded();
        let uri = if addr.starts_with("http") {
            addr.to_string()
        } else if loaded {
            format!("https://{addr}")
        } else {
            format!("http://{addr}")
        };

        let mut endpoint = Endpoint::from_shared(uri)?
            .connect_timeout(connect_timeout)
            .timeout(rpc_timeout);

        if loaded {
            endpoint = endpoint.tls_config(self.client_config()?)?;
        }

        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::certs::{generate_ca, generate_cluster_cert};

    fn test_envelope() -> TlsEnvelope {
        let ca = generate_ca().unwrap();
        let cert = generate_cluster_cert(&ca, &[]).unwrap();
        TlsEnvelope {
            ca_cert_pem: ca.cert_pem,
            cluster_cert_pem: cert.cert_pem,
            cluster_key_pem: cert.key_pem,
        }
    }

    #[test]
    fn empty_holder_reports_not_loaded() {
        let holder = TlsHolder::empty();
        assert!(!holder.is_loaded());
        assert!(matches!(holder.server_config(), Err(TlsError::NotLoaded)));
    }

    #[test]
    fn loading_envelope_makes_configs_available() {
        let holder = TlsHolder::from_envelope(test_envelope());
        assert!(holder.is_loaded());
        assert!(holder.server_config().is_ok());
        assert!(holder.client_config().is_ok());
    }

    #[test]
    fn reload_replaces_prior_material() {
        let holder = TlsHolder::from_envelope(test_envelope());
        let first = holder.envelope().unwrap();
        holder.load(test_envelope());
        let second = holder.envelope().unwrap();
        assert_ne!(first.cluster_cert_pem, second.cluster_cert_pem);
    }

    #[test]
    fn envelope_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let envelope = test_envelope();
        envelope.persist_to(dir.path()).unwrap();
        let loaded = TlsEnvelope::load_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.ca_cert_pem, envelope.ca_cert_pem);
    }

    #[test]
    fn missing_envelope_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TlsEnvelope::load_from(dir.path()).unwrap().is_none());
    }
}
