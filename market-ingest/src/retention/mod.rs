//! Bounded retention for streaming data

mod cleanup;

pub use cleanup::*;
