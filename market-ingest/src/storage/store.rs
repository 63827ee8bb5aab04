//! Persistence interface shared by every collector
//!
//! Writes follow one discipline: upsert keyed by a natural uniqueness
//! constraint, so concurrent writers to the same `(instrument, timestamp)`
//! never duplicate a row and only race on which mutable fields win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_common::{
    AggregateBar, EnrichmentRecord, HistoricalBar, Instrument, InstrumentSnapshot, PricePoint,
};
use serde::Serialize;

use super::error::StorageResult;

/// Time-series tables subject to retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesTable {
    PricePoints,
    AggregateBars,
}

impl SeriesTable {
    pub const ALL: [SeriesTable; 2] = [SeriesTable::PricePoints, SeriesTable::AggregateBars];

    pub fn table_name(&self) -> &'static str {
        match self {
            SeriesTable::PricePoints => "price_points",
            SeriesTable::AggregateBars => "aggregate_bars",
        }
    }
}

impl std::fmt::Display for SeriesTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Row counts for `db stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub instruments: i64,
    /// `(source, rows)` for price_points
    pub price_points: Vec<(String, i64)>,
    /// `(source, rows)` for aggregate_bars
    pub aggregate_bars: Vec<(String, i64)>,
    pub enrichment_records: i64,
}

/// Storage operations used by the collectors, backfill and retention
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Insert the instrument or update its snapshot fields. `None` fields keep
    /// the stored value.
    async fn upsert_instrument(&self, snapshot: &InstrumentSnapshot) -> StorageResult<Instrument>;

    /// Read-only lookup by symbol
    async fn find_instrument(&self, symbol: &str) -> StorageResult<Option<Instrument>>;

    /// Upsert keyed by `(instrument_id, timestamp)`
    async fn insert_price_point(&self, point: &PricePoint) -> StorageResult<()>;

    /// Upsert keyed by `(instrument_id, timestamp)`
    async fn insert_aggregate_bar(&self, bar: &AggregateBar) -> StorageResult<()>;

    /// Timestamps of stored price points in `[from, to]`, ascending
    async fn price_timestamps(
        &self,
        instrument_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>>;

    /// Write repair data in one transaction: every bar as a price point, and as
    /// an aggregate bar when `write_aggregates` is set. Returns rows written.
    async fn apply_repair(
        &self,
        instrument_id: i64,
        bars: &[HistoricalBar],
        write_aggregates: bool,
    ) -> StorageResult<usize>;

    /// Upsert keyed by `(instrument_id, report_date, report_type)`
    async fn upsert_enrichment(
        &self,
        instrument_id: i64,
        record: &EnrichmentRecord,
    ) -> StorageResult<()>;

    /// Up to `limit` ids of streaming rows older than `cutoff` with id greater
    /// than `after_id`, ascending
    async fn expired_ids(
        &self,
        table: SeriesTable,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> StorageResult<Vec<i64>>;

    /// Delete exactly these ids
    async fn delete_ids(&self, table: SeriesTable, ids: &[i64]) -> StorageResult<u64>;

    async fn health_check(&self) -> StorageResult<()>;

    async fn stats(&self) -> StorageResult<StoreStats>;
}
