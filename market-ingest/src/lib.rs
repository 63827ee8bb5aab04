//! # Market Ingest
//!
//! Keeps a continuous price history for a fixed set of tracked instruments.
//!
//! ## Components
//!
//! - **Streaming collector**: websocket trades and minute bars
//! - **Polling collector**: periodic snapshots, profiles and fundamentals
//! - **Backfill orchestrator**: finds gaps in stored history and repairs them
//! - **Retention cleanup**: bounds the size of the streaming tables
//!
//! Every component writes through the [`storage::MarketStore`] trait. The
//! PostgreSQL implementation sits behind a [`storage::StorageGateway`] that
//! retries transient failures and rebuilds the pool when it breaks.

pub mod backfill;
pub mod cli;
pub mod collector;
pub mod config;
pub mod provider;
pub mod retention;
pub mod storage;

// Re-export commonly used types
pub use backfill::{BackfillError, BackfillOrchestrator};
pub use collector::{PollingCollector, StreamState, StreamingCollector};
pub use self::config::Settings;
pub use provider::{RestClient, UpstreamApi, UpstreamError};
pub use retention::RetentionCleanup;
pub use storage::{InMemoryMarketStore, MarketStore, PgMarketStore, StorageError, StorageGateway};
