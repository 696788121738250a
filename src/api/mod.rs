//! HTTP surface (SPEC_FULL.md §6.5).

pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
