//! Cluster-layer error taxonomy (§7).
//!
//! Mirrors the teacher's `ErrorCategory` classification approach (a flat
//! enum with conversions at each boundary) but carries the cluster-specific
//! kinds named in the spec instead of HTTP status buckets.

use thiserror::Error;

/// Errors surfaced by the cluster fabric (TLS, pool, forwarders, store).
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Malformed request payload (bad node id, missing fields).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or unverified client certificate on a non-`Enroll` method.
    #[error("unauthenticated: missing or unverified client certificate")]
    Unauthenticated,

    /// A required callback (apply fn, record appender, enroll handler) was
    /// never wired via `ClusterServer::set_*`.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Raft has no known leader; caller may retry.
    #[error("no known leader")]
    NoLeader,

    /// Transient RPC failure; the connection has already been invalidated.
    #[error("transient rpc error: {0}")]
    Transient(String),

    /// TLS material could not be parsed or is not yet loaded.
    #[error("tls error: {0}")]
    Tls(#[from] crate::cluster::tls::TlsError),

    /// Raft-backed store failure (apply timeout, storage error).
    #[error("store error: {0}")]
    Store(String),

    /// Join-token validation failed during enrollment.
    #[error("enrollment rejected: {0}")]
    EnrollmentRejected(String),
}

impl From<ClusterError> for tonic::Status {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            ClusterError::Unauthenticated => tonic::Status::unauthenticated(e.to_string()),
            ClusterError::Unavailable(_) => tonic::Status::unavailable(e.to_string()),
            ClusterError::NoLeader => tonic::Status::unavailable(e.to_string()),
            ClusterError::Transient(_) => tonic::Status::unavailable(e.to_string()),
            ClusterError::Tls(_) => tonic::Status::internal(e.to_string()),
            ClusterError::Store(_) => tonic::Status::internal(e.to_string()),
            ClusterError::EnrollmentRejected(msg) => tonic::Status::permission_denied(msg),
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_leader_maps_to_unavailable() {
        let status: tonic::Status = ClusterError::NoLeader.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn unauthenticated_maps_correctly() {
        let status: tonic::Status = ClusterError::Unauthenticated.into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn enrollment_rejection_maps_to_permission_denied() {
        let status: tonic::Status =
            ClusterError::EnrollmentRejected("bad token".into()).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }
}
