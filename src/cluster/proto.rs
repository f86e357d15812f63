//! Generated protobuf / gRPC types for `gastrolog.v1.ClusterService`.
//!
//! Code is generated by `build.rs` (protox + tonic-build) from
//! `proto/gastrolog.proto`; this module just re-exports it under a short path.

tonic::include_proto!("gastrolog.v1");
