//! Storage layer for market data
//!
//! The [`StorageGateway`] owns the shared pool and its retry/repair policy.
//! Components talk to storage only through the [`MarketStore`] trait, backed by
//! PostgreSQL in production and by [`InMemoryMarketStore`] for dry runs and tests.

mod error;
mod gateway;
mod memory;
mod repository;
pub mod schema;
mod store;

pub use error::*;
pub use gateway::*;
pub use memory::*;
pub use repository::*;
pub use store::*;
