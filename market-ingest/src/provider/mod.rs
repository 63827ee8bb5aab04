//! Upstream market data provider
//!
//! [`UpstreamApi`] is the REST seam used by the polling collector and the
//! backfill orchestrator. [`RestClient`] talks to the real provider; the stream
//! side is consumed directly by the streaming collector using the frame types in
//! [`types`].

mod cache;
mod client;
mod mock;
mod traits;
pub mod types;

pub use cache::TtlCache;
pub use client::RestClient;
pub use mock::{HistoricalCall, MockUpstream};
pub use traits::*;
