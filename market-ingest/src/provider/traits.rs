//! Upstream provider interface
//!
//! The client never retries; each caller applies its own policy. Polling skips
//! a failed symbol for the cycle, backfill records a gap error, streaming drops
//! the message.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_common::error::{ErrorCategory, ErrorClassification};
use market_common::{EnrichmentRecord, Granularity, HistoricalBar};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upstream error types
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request error: {0}")]
    Request(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorClassification for UpstreamError {
    fn category(&self) -> ErrorCategory {
        match self {
            UpstreamError::Timeout(_) => ErrorCategory::Transient,
            UpstreamError::Request(_) => ErrorCategory::Transient,
            UpstreamError::Http { status, .. } if *status >= 500 => ErrorCategory::Transient,
            UpstreamError::Http { .. } => ErrorCategory::Permanent,
            UpstreamError::Authentication(_) => ErrorCategory::Configuration,
            UpstreamError::RateLimit(_) => ErrorCategory::ResourceExhausted,
            UpstreamError::NotFound(_) => ErrorCategory::Permanent,
            UpstreamError::Parse(_) => ErrorCategory::Permanent,
            UpstreamError::Connection(_) => ErrorCategory::Transient,
            UpstreamError::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimit(_) => Some(Duration::from_secs(60)),
            UpstreamError::Connection(_) => Some(Duration::from_secs(5)),
            UpstreamError::Timeout(_) | UpstreamError::Request(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Consolidated current state for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    /// Latest trade price
    pub price: Decimal,
    /// Size of the latest trade
    pub trade_size: i64,
    /// Time of the latest trade
    pub timestamp: DateTime<Utc>,
    /// Session volume so far
    pub volume: Option<i64>,
    /// Change against the previous close
    pub change_amount: Option<Decimal>,
    pub change_percent: Option<Decimal>,
    /// Most recent completed minute bar
    pub minute_bar: Option<HistoricalBar>,
}

/// Descriptive metadata for a symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub symbol: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub market_cap: Option<Decimal>,
    pub pe_ratio: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub high_52w: Option<Decimal>,
    pub low_52w: Option<Decimal>,
}

/// Typed access to the provider's REST endpoints
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn get_snapshot(&self, symbol: &str) -> UpstreamResult<Snapshot>;

    async fn get_profile(&self, symbol: &str) -> UpstreamResult<Profile>;

    /// Bars covering `[from, to]` at the given granularity, ascending
    async fn get_historical_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> UpstreamResult<Vec<HistoricalBar>>;

    /// Optional enrichment. `Ok(None)` means the provider has nothing for this symbol.
    async fn get_fundamentals(&self, symbol: &str) -> UpstreamResult<Option<Vec<EnrichmentRecord>>>;
}
