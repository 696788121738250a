//! Data model: micros arithmetic and the entities of SPEC_FULL.md §3.

pub mod entities;
pub mod micros;

pub use entities::*;
pub use micros::{Amount, Bps, PriceMicros, MICRO};
