//! Persisted state (SPEC_FULL.md §6.3/§6.4): copy attempts, fills, ledger
//! entries, and the sparse portfolio/price snapshot series the executor
//! reads from.

pub mod schema;
pub mod store;

pub use store::Store;
