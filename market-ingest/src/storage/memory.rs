//! In-memory [`MarketStore`]
//!
//! Same uniqueness, upsert and pagination semantics as the PostgreSQL store,
//! without a database. Backs `serve --dry-run` and the test suites, and can
//! inject transient failures to exercise retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use market_common::error::DatabaseError;
use market_common::{
    AggregateBar, DataSource, EnrichmentRecord, HistoricalBar, Instrument, InstrumentSnapshot,
    PricePoint,
};
use parking_lot::Mutex;

use super::error::{StorageError, StorageResult};
use super::store::{MarketStore, SeriesTable, StoreStats};

type SeriesKey = (i64, DateTime<Utc>);

#[derive(Default)]
struct MemoryState {
    instruments: BTreeMap<String, Instrument>,
    next_instrument_id: i64,
    next_row_id: i64,
    price_points: BTreeMap<i64, PricePoint>,
    price_keys: HashMap<SeriesKey, i64>,
    aggregate_bars: BTreeMap<i64, AggregateBar>,
    bar_keys: HashMap<SeriesKey, i64>,
    enrichment: HashMap<(i64, NaiveDate, String), EnrichmentRecord>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn upsert_point(&mut self, point: &PricePoint) {
        let key = (point.instrument_id, point.timestamp);
        match self.price_keys.get(&key).copied() {
            Some(id) => {
                if let Some(existing) = self.price_points.get_mut(&id) {
                    if existing.source.yields_to(point.source) {
                        existing.price = point.price;
                        existing.volume = point.volume;
                        existing.source = point.source;
                    }
                }
            }
            None => {
                let id = self.next_id();
                self.price_points.insert(id, point.clone());
                self.price_keys.insert(key, id);
            }
        }
    }

    fn upsert_bar(&mut self, bar: &AggregateBar) {
        let key = (bar.instrument_id, bar.timestamp);
        match self.bar_keys.get(&key).copied() {
            Some(id) => {
                if let Some(existing) = self.aggregate_bars.get_mut(&id) {
                    if existing.source.yields_to(bar.source) {
                        let vwap = bar.vwap.or(existing.vwap);
                        *existing = AggregateBar {
                            vwap,
                            ..bar.clone()
                        };
                    }
                }
            }
            None => {
                let id = self.next_id();
                self.aggregate_bars.insert(id, bar.clone());
                self.bar_keys.insert(key, id);
            }
        }
    }

    fn has_instrument_id(&self, instrument_id: i64) -> bool {
        self.instruments.values().any(|i| i.id == instrument_id)
    }
}

/// Market data store held in process memory
#[derive(Default)]
pub struct InMemoryMarketStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    failing_deletes: AtomicU32,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with a connection error while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` deletes fail with a transient connection error
    pub fn fail_next_deletes(&self, count: u32) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Database(DatabaseError::Connection(
                "connection lost".to_string(),
            )));
        }
        Ok(())
    }

    /// Stored price points for a symbol, ordered by timestamp
    pub fn price_points(&self, symbol: &str) -> Vec<PricePoint> {
        let state = self.state.lock();
        let Some(instrument) = state.instruments.get(symbol) else {
            return Vec::new();
        };
        let mut points: Vec<PricePoint> = state
            .price_points
            .values()
            .filter(|p| p.instrument_id == instrument.id)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Stored aggregate bars for a symbol, ordered by timestamp
    pub fn aggregate_bars(&self, symbol: &str) -> Vec<AggregateBar> {
        let state = self.state.lock();
        let Some(instrument) = state.instruments.get(symbol) else {
            return Vec::new();
        };
        let mut bars: Vec<AggregateBar> = state
            .aggregate_bars
            .values()
            .filter(|b| b.instrument_id == instrument.id)
            .cloned()
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        bars
    }

    pub fn enrichment_count(&self) -> usize {
        self.state.lock().enrichment.len()
    }

    pub fn instrument_count(&self) -> usize {
        self.state.lock().instruments.len()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    async fn upsert_instrument(&self, snapshot: &InstrumentSnapshot) -> StorageResult<Instrument> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();

        if let Some(existing) = state.instruments.get_mut(&snapshot.symbol) {
            existing.name = snapshot.name.clone().or(existing.name.take());
            existing.sector = snapshot.sector.clone().or(existing.sector.take());
            existing.last_price = snapshot.last_price.or(existing.last_price);
            existing.change_amount = snapshot.change_amount.or(existing.change_amount);
            existing.change_percent = snapshot.change_percent.or(existing.change_percent);
            existing.volume = snapshot.volume.or(existing.volume);
            existing.market_cap = snapshot.market_cap.or(existing.market_cap);
            existing.pe_ratio = snapshot.pe_ratio.or(existing.pe_ratio);
            existing.dividend_yield = snapshot.dividend_yield.or(existing.dividend_yield);
            existing.high_52w = snapshot.high_52w.or(existing.high_52w);
            existing.low_52w = snapshot.low_52w.or(existing.low_52w);
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        state.next_instrument_id += 1;
        let instrument = Instrument {
            id: state.next_instrument_id,
            symbol: snapshot.symbol.clone(),
            name: snapshot.name.clone(),
            sector: snapshot.sector.clone(),
            last_price: snapshot.last_price,
            change_amount: snapshot.change_amount,
            change_percent: snapshot.change_percent,
            volume: snapshot.volume,
            market_cap: snapshot.market_cap,
            pe_ratio: snapshot.pe_ratio,
            dividend_yield: snapshot.dividend_yield,
            high_52w: snapshot.high_52w,
            low_52w: snapshot.low_52w,
            updated_at: now,
        };
        state
            .instruments
            .insert(instrument.symbol.clone(), instrument.clone());
        Ok(instrument)
    }

    async fn find_instrument(&self, symbol: &str) -> StorageResult<Option<Instrument>> {
        self.check_available()?;
        Ok(self.state.lock().instruments.get(symbol).cloned())
    }

    async fn insert_price_point(&self, point: &PricePoint) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.has_instrument_id(point.instrument_id) {
            return Err(StorageError::InvalidData(format!(
                "unknown instrument id {}",
                point.instrument_id
            )));
        }
        state.upsert_point(point);
        Ok(())
    }

    async fn insert_aggregate_bar(&self, bar: &AggregateBar) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.has_instrument_id(bar.instrument_id) {
            return Err(StorageError::InvalidData(format!(
                "unknown instrument id {}",
                bar.instrument_id
            )));
        }
        state.upsert_bar(bar);
        Ok(())
    }

    async fn price_timestamps(
        &self,
        instrument_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut timestamps: Vec<DateTime<Utc>> = state
            .price_points
            .values()
            .filter(|p| p.instrument_id == instrument_id && p.timestamp >= from && p.timestamp <= to)
            .map(|p| p.timestamp)
            .collect();
        timestamps.sort_unstable();
        Ok(timestamps)
    }

    async fn apply_repair(
        &self,
        instrument_id: i64,
        bars: &[HistoricalBar],
        write_aggregates: bool,
    ) -> StorageResult<usize> {
        self.check_available()?;
        let mut state = self.state.lock();
        if !state.has_instrument_id(instrument_id) {
            return Err(StorageError::InvalidData(format!(
                "unknown instrument id {}",
                instrument_id
            )));
        }

        let mut written = 0;
        for bar in bars {
            state.upsert_point(&bar.to_price_point(instrument_id, DataSource::Repair));
            written += 1;
            if write_aggregates {
                state.upsert_bar(&bar.to_aggregate_bar(instrument_id, DataSource::Repair));
                written += 1;
            }
        }
        Ok(written)
    }

    async fn upsert_enrichment(
        &self,
        instrument_id: i64,
        record: &EnrichmentRecord,
    ) -> StorageResult<()> {
        self.check_available()?;
        self.state.lock().enrichment.insert(
            (instrument_id, record.report_date, record.report_type.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn expired_ids(
        &self,
        table: SeriesTable,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> StorageResult<Vec<i64>> {
        self.check_available()?;
        let state = self.state.lock();
        let limit = usize::try_from(limit).unwrap_or(0);
        let lower = after_id.saturating_add(1);

        let ids = match table {
            SeriesTable::PricePoints => state
                .price_points
                .range(lower..)
                .filter(|(_, p)| p.source == DataSource::Streaming && p.timestamp < cutoff)
                .map(|(id, _)| *id)
                .take(limit)
                .collect(),
            SeriesTable::AggregateBars => state
                .aggregate_bars
                .range(lower..)
                .filter(|(_, b)| b.source == DataSource::Streaming && b.timestamp < cutoff)
                .map(|(id, _)| *id)
                .take(limit)
                .collect(),
        };
        Ok(ids)
    }

    async fn delete_ids(&self, table: SeriesTable, ids: &[i64]) -> StorageResult<u64> {
        self.check_available()?;
        let pending = self.failing_deletes.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_deletes.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Database(DatabaseError::Connection(
                "connection reset by peer".to_string(),
            )));
        }

        let mut state = self.state.lock();
        let mut deleted = 0;
        for id in ids {
            match table {
                SeriesTable::PricePoints => {
                    if let Some(point) = state.price_points.remove(id) {
                        state.price_keys.remove(&(point.instrument_id, point.timestamp));
                        deleted += 1;
                    }
                }
                SeriesTable::AggregateBars => {
                    if let Some(bar) = state.aggregate_bars.remove(id) {
                        state.bar_keys.remove(&(bar.instrument_id, bar.timestamp));
                        deleted += 1;
                    }
                }
            }
        }
        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check_available()
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        self.check_available()?;
        let state = self.state.lock();

        let count_by_source = |sources: Vec<DataSource>| {
            let mut counts: BTreeMap<String, i64> = BTreeMap::new();
            for source in sources {
                *counts.entry(source.to_string()).or_default() += 1;
            }
            counts.into_iter().collect::<Vec<_>>()
        };

        Ok(StoreStats {
            instruments: state.instruments.len() as i64,
            price_points: count_by_source(state.price_points.values().map(|p| p.source).collect()),
            aggregate_bars: count_by_source(
                state.aggregate_bars.values().map(|b| b.source).collect(),
            ),
            enrichment_records: state.enrichment.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[tokio::test]
    async fn test_upsert_instrument_keeps_existing_metadata() {
        let store = InMemoryMarketStore::new();
        let created = store
            .upsert_instrument(&InstrumentSnapshot::new("AAPL").with_name("Apple Inc.").with_sector("Technology"))
            .await
            .unwrap();

        let updated = store
            .upsert_instrument(&InstrumentSnapshot::new("AAPL").with_price(dec!(190.5)))
            .await
            .unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.name.as_deref(), Some("Apple Inc."));
        assert_eq!(updated.last_price, Some(dec!(190.5)));
        assert_eq!(store.instrument_count(), 1);
    }

    #[tokio::test]
    async fn test_point_requires_instrument() {
        let store = InMemoryMarketStore::new();
        let point = PricePoint::new(99, dec!(1), 1, t(0), DataSource::Polling);
        assert!(matches!(
            store.insert_price_point(&point).await,
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_lower_priority_write_leaves_row_untouched() {
        let store = InMemoryMarketStore::new();
        let id = store
            .upsert_instrument(&InstrumentSnapshot::new("AAPL"))
            .await
            .unwrap()
            .id;

        store
            .insert_price_point(&PricePoint::new(id, dec!(150), 900, t(0), DataSource::Repair))
            .await
            .unwrap();
        store
            .insert_price_point(&PricePoint::new(id, dec!(1), 1, t(0), DataSource::Streaming))
            .await
            .unwrap();

        let points = store.price_points("AAPL");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].price, dec!(150));
        assert_eq!(points[0].volume, 900);
        assert_eq!(points[0].source, DataSource::Repair);

        // Equal priority is last-write-wins
        store
            .insert_price_point(&PricePoint::new(id, dec!(151), 901, t(0), DataSource::Repair))
            .await
            .unwrap();
        assert_eq!(store.price_points("AAPL")[0].price, dec!(151));
    }

    #[tokio::test]
    async fn test_expired_ids_paginate_streaming_only() {
        let store = InMemoryMarketStore::new();
        let id = store
            .upsert_instrument(&InstrumentSnapshot::new("MSFT"))
            .await
            .unwrap()
            .id;

        for minute in 0..5 {
            let source = if minute % 2 == 0 {
                DataSource::Streaming
            } else {
                DataSource::Polling
            };
            store
                .insert_price_point(&PricePoint::new(id, dec!(400), 10, t(minute), source))
                .await
                .unwrap();
        }

        let first = store
            .expired_ids(SeriesTable::PricePoints, t(10), 0, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let rest = store
            .expired_ids(SeriesTable::PricePoints, t(10), *first.last().unwrap(), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0] > first[1]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = InMemoryMarketStore::new();
        store.set_unavailable(true);
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_connection_loss());
    }
}
