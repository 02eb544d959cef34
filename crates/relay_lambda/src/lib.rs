//! AWS-oriented adapters and handlers for the event relay.
//!
//! This crate owns runtime integration details (Lambda handlers, queue and
//! storage adapters, tracing setup) on top of the deployment-agnostic
//! `relay_core` crate.

pub mod adapters;
pub mod handlers;
pub mod telemetry;
