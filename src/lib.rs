//! Copy-trading execution simulator — library crate.
//!
//! Exposes the engine modules for the `copytrail` binary and for
//! integration tests: the domain model, the ingest/aggregation pipeline,
//! the multi-scope executor, persistence, config, and the read-write HTTP
//! surface.

pub mod aggregate;
pub mod api;
pub mod book;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod middleware;
pub mod model;
