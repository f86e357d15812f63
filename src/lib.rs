//! GastroLog cluster fabric and query language core.
//!
//! `cluster` is the Raft-backed configuration store, mTLS peer plane,
//! record forwarding, and gossip broadcast layer (§4). `query` is the
//! dual-mode lexer, boolean filter grammar, DNF normaliser, pipeline
//! parser, and scalar evaluator (§2, §4.11–§4.16). The two are
//! independent — `query` has no dependency on `cluster` or vice versa.

pub mod cluster;
pub mod query;
