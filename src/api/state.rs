//! Axum `State` extractor payload (SPEC_FULL.md §6.5).
//!
//! Grounded on `main.rs`'s `AppState` struct in the donor, generalized from
//! a single `Arc<Mutex<...>>` ledger to the executor's `Services` bundle.

use crate::executor::Services;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Self {
        AppState { services }
    }
}
