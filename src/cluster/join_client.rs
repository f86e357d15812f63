//! Join-time enrollment client (§4.2, §9 TOFU design note).
//!
//! A joining node calls an existing member's `Enroll` RPC and gets back
//! cluster TLS material. Trust is established by checking the returned
//! CA's fingerprint against the one bound into the join token
//! (`certs::verify_ca_fingerprint`), not by the connection's own
//! certificate validation — the joiner has no CA to validate against
//! before enrollment completes, so `bootstrap_ca_pem` (the CA's public
//! cert, distributed alongside the join token through the same
//! out-of-band channel an operator already uses to hand out the token)
//! is what the channel itself trusts; the fingerprint check is the actual
//! security boundary.

use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use crate::cluster::certs::{verify_ca_fingerprint, JoinToken};
use crate::cluster::proto::cluster_service_client::ClusterServiceClient;
use crate::cluster::proto::EnrollRequest;
use crate::cluster::tls::TlsEnvelope;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("invalid join token: {0}")]
    InvalidToken(String),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("enroll rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("returned CA does not match the join token's fingerprint")]
    FingerprintMismatch,
}

/// Enrolls with the member at `join_addr`, returning TLS material ready to
/// hand to `TlsEnvelope::persist_to` + `TlsHolder::load`.
pub async fn enroll(
    join_addr: &str,
    bootstrap_ca_pem: &str,
    join_token_str: &str,
    node_id: &str,
    node_addr: &str,
) -> Result<TlsEnvelope, JoinError> {
    let token = JoinToken::parse(join_token_str).map_err(|e| JoinError::InvalidToken(e.to_string()))?;

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(bootstrap_ca_pem))
        .domain_name("localhost");

    let endpoint = Endpoint::from_shared(format!("https://{join_addr}"))?.tls_config(tls)?;
    let channel: Channel = endpoint.connect().await?;
    let mut client = ClusterServiceClient::new(channel);

    let response = client
        .enroll(EnrollRequest {
            token_secret: hex::encode(token.secret),
            node_id: node_id.to_string(),
            node_addr: node_addr.to_string(),
        })
        .await?
        .into_inner();

    if !verify_ca_fingerprint(&response.ca_cert_pem, &hex::encode(token.ca_fingerprint)) {
        return Err(JoinError::FingerprintMismatch);
    }

    Ok(TlsEnvelope {
        ca_cert_pem: response.ca_cert_pem,
        cluster_cert_pem: response.cluster_cert_pem,
        cluster_key_pem: response.cluster_key_pem,
    })
}
