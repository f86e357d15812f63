//! Server-side `Enroll` handler (§4.2, §4.3).
//!
//! Holds the cluster CA's signing material and the currently outstanding
//! join token's secret. `GeneratedCa` signs the joiner's leaf cert;
//! `pending` enforces the single-use contract the join-token wire format
//! itself declares ("consumption semantics enforced by the enroll handler,
//! which is external to this core but must honor that contract").

use std::sync::Mutex;

use tracing::info;

use crate::cluster::certs::{generate_cluster_cert, GeneratedCa};
use crate::cluster::errors::{ClusterError, ClusterResult};
use crate::cluster::server::{EnrollHandler, EnrollMaterial};

pub struct LocalEnrollHandler {
    ca: GeneratedCa,
    pending: Mutex<Option<[u8; 32]>>,
}

impl LocalEnrollHandler {
    pub fn new(ca: GeneratedCa, token_secret: [u8; 32]) -> Self {
        Self {
            ca,
            pending: Mutex::new(Some(token_secret)),
        }
    }

    /// Issues a fresh token secret for the next joiner, replacing whatever
    /// was outstanding (e.g. expired or never consumed).
    pub fn reissue(&self, token_secret: [u8; 32]) {
        *self.pending.lock().unwrap() = Some(token_secret);
    }
}

impl EnrollHandler for LocalEnrollHandler {
    fn enroll(&self, token_secret: &str, node_id: &str, node_addr: &str) -> ClusterResult<EnrollMaterial> {
        let presented = hex::decode(token_secret)
            .map_err(|e| ClusterError::EnrollmentRejected(format!("malformed token secret: {e}")))?;

        let mut pending = self.pending.lock().unwrap();
        let expected = pending.ok_or_else(|| ClusterError::EnrollmentRejected("no join token outstanding".to_string()))?;
        if presented.as_slice() != expected {
            return Err(ClusterError::EnrollmentRejected("token secret mismatch".to_string()));
        }
        // Single-use: the next enroll attempt finds nothing pending.
        *pending = None;
        drop(pending);

        let cert = generate_cluster_cert(&self.ca, &[node_id.to_string(), node_addr.to_string()])
            .map_err(|e| ClusterError::EnrollmentRejected(format!("cert generation failed: {e}")))?;

        info!(node_id, node_addr, "enrolled new cluster member");

        Ok(EnrollMaterial {
            ca_cert_pem: self.ca.cert_pem.clone(),
            cluster_cert_pem: cert.cert_pem,
            cluster_key_pem: cert.key_pem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::certs::{generate_ca, generate_join_token, JoinToken};

    #[test]
    fn enroll_with_matching_secret_succeeds() {
        let ca = generate_ca().unwrap();
        let token = generate_join_token(&ca).unwrap();
        let parsed = JoinToken::parse(&token).unwrap();
        let handler = LocalEnrollHandler::new(ca, parsed.secret);

        let material = handler.enroll(&hex::encode(parsed.secret), "node-2", "10.0.0.2:7420").unwrap();
        assert!(material.cluster_cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn enroll_is_single_use() {
        let ca = generate_ca().unwrap();
        let token = generate_join_token(&ca).unwrap();
        let parsed = JoinToken::parse(&token).unwrap();
        let handler = LocalEnrollHandler::new(ca, parsed.secret);

        handler.enroll(&hex::encode(parsed.secret), "node-2", "10.0.0.2:7420").unwrap();
        let second = handler.enroll(&hex::encode(parsed.secret), "node-3", "10.0.0.3:7420");
        assert!(matches!(second, Err(ClusterError::EnrollmentRejected(_))));
    }

    #[test]
    fn enroll_rejects_wrong_secret() {
        let ca = generate_ca().unwrap();
        let token = generate_join_token(&ca).unwrap();
        let parsed = JoinToken::parse(&token).unwrap();
        let handler = LocalEnrollHandler::new(ca, parsed.secret);

        let wrong = hex::encode([0u8; 32]);
        let err = handler.enroll(&wrong, "node-2", "10.0.0.2:7420").unwrap_err();
        assert!(matches!(err, ClusterError::EnrollmentRejected(_)));
    }

    #[test]
    fn reissue_allows_another_join() {
        let ca = generate_ca().unwrap();
        let token = generate_join_token(&ca).unwrap();
        let parsed = JoinToken::parse(&token).unwrap();
        let handler = LocalEnrollHandler::new(ca, parsed.secret);
        handler.enroll(&hex::encode(parsed.secret), "node-2", "10.0.0.2:7420").unwrap();

        let fresh_secret = [7u8; 32];
        handler.reissue(fresh_secret);
        let material = handler.enroll(&hex::encode(fresh_secret), "node-3", "10.0.0.3:7420").unwrap();
        assert!(material.cluster_cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
