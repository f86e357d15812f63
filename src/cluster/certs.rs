//! Certificate & join-token utilities (§4.2).
//!
//! All functions here are stateless — no shared state, easy to unit test in
//! isolation. Grounded on `rcgen`'s self-signed CA pattern (the same crate
//! `nexi-lab-nexus`'s `raft` crate pulls in specifically for "Server-side
//! node cert generation for JoinCluster") and on the enrollment-token shape
//! used by `haasonsaas-flockmind`'s `auth::enrollment` module, adapted to the
//! `<hex-secret>:<hex-sha256(ca)>` wire format this spec requires.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::io::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};

const CA_COMMON_NAME: &str = "gastrolog-cluster-ca";
const CA_VALIDITY_YEARS: i64 = 10;
const ALWAYS_ON_SANS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("invalid join token: {0}")]
    InvalidToken(String),
}

/// A generated self-signed CA: PEM material plus the key pair and signing
/// certificate so `generate_cluster_cert` can sign leaf certs with it.
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
    key_pair: Arc<KeyPair>,
    cert: Arc<Certificate>,
}

impl GeneratedCa {
    /// DER bytes of the CA certificate, used for join-token fingerprinting.
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// Rebuilds a `GeneratedCa` from a previously persisted cert/key PEM
    /// pair, so a node that bootstrapped a CA on an earlier run can keep
    /// signing joiners' certs with it after a restart.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CertError::Generation(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| CertError::Generation(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::Generation(e.to_string()))?;

        Ok(GeneratedCa {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            key_pair: Arc::new(key_pair),
            cert: Arc::new(cert),
        })
    }
}

/// A generated leaf (node) certificate.
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Self-signed ECDSA P-256 CA, 10-year validity, CN `gastrolog-cluster-ca`,
/// keyUsage CertSign+CRLSign, basicConstraints CA=true with pathLen=0.
pub fn generate_ca() -> Result<GeneratedCa, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::hours(1);
    params.not_after = now + TimeDuration::days(365 * CA_VALIDITY_YEARS);

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    Ok(GeneratedCa {
        cert_pem,
        key_pem,
        key_pair: Arc::new(key_pair),
        cert: Arc::new(cert),
    })
}

/// Signed ECDSA P-256 cluster node certificate. SANs always include
/// `localhost`, `127.0.0.1`, `::1` plus `extra_sans` (IP-looking strings
/// become IP SANs, everything else becomes a DNS SAN).
pub fn generate_cluster_cert(
    ca: &GeneratedCa,
    extra_sans: &[String],
) -> Result<GeneratedCert, CertError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "gastrolog-node");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::hours(1);
    params.not_after = now + TimeDuration::days(365 * 2);

    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let mut sans: Vec<SanType> = Vec::new();
    for host in ALWAYS_ON_SANS.iter().map(|s| s.to_string()).chain(extra_sans.iter().cloned()) {
        sans.push(classify_san(&host));
    }
    // Dedup while preserving order (small N, no need for a set).
    let mut seen = Vec::new();
    sans.retain(|s| {
        let key = format!("{:?}", s);
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
    params.subject_alt_names = sans;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .signed_by(&key_pair, &ca.cert, &ca.key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    Ok(GeneratedCert { cert_pem, key_pem })
}

/// Persists the CA's private key alongside `tls.json` (which already holds
/// the CA's public cert via `TlsEnvelope::ca_cert_pem`) so whichever node
/// bootstrapped the cluster can keep signing joiners' certs after a
/// restart. Same write-temp-then-rename, mode-0600 shape as
/// `TlsEnvelope::persist_to` — this file is as sensitive as the node's own
/// key.
pub fn persist_ca_key(data_dir: &Path, key_pem: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let final_path = data_dir.join("ca_key.pem");
    let tmp_path = data_dir.join("ca_key.pem.tmp");

    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(key_pem.as_bytes())?;
        f.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, &final_path)
}

/// Loads a previously persisted CA private key, if this node holds one.
pub fn load_ca_key(data_dir: &Path) -> std::io::Result<Option<String>> {
    let path = data_dir.join("ca_key.pem");
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(std::fs::read_to_string(path)?))
}

fn classify_san(host: &str) -> SanType {
    match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.to_string()),
    }
}

/// A parsed join token: `<hex-secret>:<hex-sha256(CA DER)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinToken {
    pub secret: [u8; 32],
    pub ca_fingerprint: [u8; 32],
}

impl JoinToken {
    /// Generate a fresh single-use join token bound to the given CA.
    pub fn generate(ca_der: &[u8]) -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let ca_fingerprint = sha256(ca_der);
        Self {
            secret,
            ca_fingerprint,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", hex::encode(self.secret), hex::encode(self.ca_fingerprint))
    }

    pub fn parse(token: &str) -> Result<Self, CertError> {
        let (secret_hex, fp_hex) = token
            .split_once(':')
            .ok_or_else(|| CertError::InvalidToken("missing ':' separator".into()))?;

        let secret_vec = hex::decode(secret_hex)
            .map_err(|e| CertError::InvalidToken(format!("bad secret hex: {e}")))?;
        let fp_vec = hex::decode(fp_hex)
            .map_err(|e| CertError::InvalidToken(format!("bad fingerprint hex: {e}")))?;

        let secret: [u8; 32] = secret_vec
            .try_into()
            .map_err(|_| CertError::InvalidToken("secret must be 32 bytes".into()))?;
        let ca_fingerprint: [u8; 32] = fp_vec
            .try_into()
            .map_err(|_| CertError::InvalidToken("fingerprint must be 32 bytes".into()))?;

        Ok(Self {
            secret,
            ca_fingerprint,
        })
    }
}

/// `GenerateJoinToken(ca)` from §4.2: 32 random bytes + SHA-256(CA DER), hex
/// encoded, colon-separated.
pub fn generate_join_token(ca: &GeneratedCa) -> Result<String, CertError> {
    Ok(JoinToken::generate(&ca.der()).encode())
}

/// Constant-time comparison of a CA's fingerprint against the hex hash
/// bound into a join token (TOFU verification at enrollment time).
pub fn verify_ca_fingerprint(ca_pem: &str, hex_hash: &str) -> bool {
    let Ok(expected) = hex::decode(hex_hash) else {
        return false;
    };
    let Ok(der) = pem_to_der(ca_pem) else {
        return false;
    };
    let actual = sha256(&der);
    constant_time_eq(&actual, &expected)
}

fn pem_to_der(pem_str: &str) -> Result<Vec<u8>, CertError> {
    pem::parse(pem_str)
        .map(|p| p.contents().to_vec())
        .map_err(|e| CertError::InvalidToken(e.to_string()))
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_generates_valid_pem() {
        let ca = generate_ca().unwrap();
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn cluster_cert_includes_default_sans_plus_extras() {
        let ca = generate_ca().unwrap();
        let cert = generate_cluster_cert(&ca, &["node-3.internal".to_string(), "10.0.0.5".to_string()]).unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn san_classification_distinguishes_ip_from_dns() {
        assert!(matches!(classify_san("127.0.0.1"), SanType::IpAddress(_)));
        assert!(matches!(classify_san("node-1.local"), SanType::DnsName(_)));
    }

    #[test]
    fn join_token_roundtrips_through_encode_parse() {
        let ca = generate_ca().unwrap();
        let der = ca.der();
        let token = JoinToken::generate(&der);
        let encoded = token.encode();
        let parsed = JoinToken::parse(&encoded).unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn join_token_secret_and_fingerprint_are_32_bytes() {
        let ca = generate_ca().unwrap();
        let token_str = generate_join_token(&ca).unwrap();
        let (secret_hex, fp_hex) = token_str.split_once(':').unwrap();
        assert_eq!(secret_hex.len(), 64);
        assert_eq!(fp_hex.len(), 64);
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(JoinToken::parse("deadbeef").is_err());
    }

    #[test]
    fn parse_rejects_wrong_length_secret() {
        assert!(JoinToken::parse("ab:cd").is_err());
    }

    #[test]
    fn fingerprint_verification_accepts_matching_ca() {
        let ca = generate_ca().unwrap();
        let token = generate_join_token(&ca).unwrap();
        let (_, fp_hex) = token.split_once(':').unwrap();
        assert!(verify_ca_fingerprint(&ca.cert_pem, fp_hex));
    }

    #[test]
    fn fingerprint_verification_rejects_mismatched_ca() {
        let ca1 = generate_ca().unwrap();
        let ca2 = generate_ca().unwrap();
        let token = generate_join_token(&ca1).unwrap();
        let (_, fp_hex) = token.split_once(':').unwrap();
        assert!(!verify_ca_fingerprint(&ca2.cert_pem, fp_hex));
    }

    #[test]
    fn ca_rebuilt_from_pem_signs_certs_with_the_same_fingerprint() {
        let ca = generate_ca().unwrap();
        let der = ca.der();

        let reloaded = GeneratedCa::from_pem(&ca.cert_pem, &ca.key_pem).unwrap();
        assert_eq!(reloaded.der(), der);

        let cert = generate_cluster_cert(&reloaded, &["node-2".to_string()]).unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn ca_key_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ca = generate_ca().unwrap();
        persist_ca_key(dir.path(), &ca.key_pem).unwrap();
        let loaded = load_ca_key(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, ca.key_pem);
    }

    #[test]
    fn missing_ca_key_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_ca_key(dir.path()).unwrap().is_none());
    }
}
