//! Shared event-relay domain primitives.
//!
//! This crate owns the deterministic relay behavior: the event contract,
//! ingress normalization, rule-based routing, the durable queue contract with
//! an in-memory store, and the consumer worker loop. It intentionally excludes
//! AWS SDK and Lambda runtime concerns, which live in `relay_lambda`.

pub mod clock;
pub mod config;
pub mod contract;
pub mod error;
pub mod ingress;
pub mod queue;
pub mod routing;
pub mod storage_keys;
pub mod worker;

pub use error::RelayError;
