//! PostgreSQL implementation of [`MarketStore`]
//!
//! Every statement runs through the [`StorageGateway`], so each call retries
//! transient failures and uses whichever pool is current at the time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_common::{
    AggregateBar, DataSource, EnrichmentRecord, HistoricalBar, Instrument, InstrumentSnapshot,
    PricePoint,
};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::error::StorageResult;
use super::gateway::StorageGateway;
use super::store::{MarketStore, SeriesTable, StoreStats};

const INSTRUMENT_COLUMNS: &str = "id, symbol, name, sector, last_price, change_amount, \
    change_percent, volume, market_cap, pe_ratio, dividend_yield, high_52w, low_52w, updated_at";

const UPSERT_PRICE_POINT: &str = r#"
    INSERT INTO price_points (instrument_id, price, volume, ts, source)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (instrument_id, ts) DO UPDATE SET
        price = EXCLUDED.price,
        volume = EXCLUDED.volume,
        source = EXCLUDED.source
    WHERE source_rank(EXCLUDED.source) >= source_rank(price_points.source)
"#;

const UPSERT_AGGREGATE_BAR: &str = r#"
    INSERT INTO aggregate_bars (instrument_id, open, high, low, close, volume, vwap, ts, source)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (instrument_id, ts) DO UPDATE SET
        open = EXCLUDED.open,
        high = EXCLUDED.high,
        low = EXCLUDED.low,
        close = EXCLUDED.close,
        volume = EXCLUDED.volume,
        vwap = COALESCE(EXCLUDED.vwap, aggregate_bars.vwap),
        source = EXCLUDED.source
    WHERE source_rank(EXCLUDED.source) >= source_rank(aggregate_bars.source)
"#;

/// Market data store backed by PostgreSQL
pub struct PgMarketStore {
    gateway: Arc<StorageGateway>,
}

impl PgMarketStore {
    pub fn new(gateway: Arc<StorageGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<StorageGateway> {
        &self.gateway
    }
}

fn instrument_from_row(row: &PgRow) -> Result<Instrument, sqlx::Error> {
    Ok(Instrument {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
        last_price: row.try_get("last_price")?,
        change_amount: row.try_get("change_amount")?,
        change_percent: row.try_get("change_percent")?,
        volume: row.try_get("volume")?,
        market_cap: row.try_get("market_cap")?,
        pe_ratio: row.try_get("pe_ratio")?,
        dividend_yield: row.try_get("dividend_yield")?,
        high_52w: row.try_get("high_52w")?,
        low_52w: row.try_get("low_52w")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_price_point(
    tx: &mut Transaction<'static, Postgres>,
    point: &PricePoint,
) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_PRICE_POINT)
        .bind(point.instrument_id)
        .bind(point.price)
        .bind(point.volume)
        .bind(point.timestamp)
        .bind(point.source.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn write_aggregate_bar(
    tx: &mut Transaction<'static, Postgres>,
    bar: &AggregateBar,
) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_AGGREGATE_BAR)
        .bind(bar.instrument_id)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.vwap)
        .bind(bar.timestamp)
        .bind(bar.source.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl MarketStore for PgMarketStore {
    async fn upsert_instrument(&self, snapshot: &InstrumentSnapshot) -> StorageResult<Instrument> {
        let sql = format!(
            r#"
            INSERT INTO instruments (
                symbol, name, sector, last_price, change_amount, change_percent, volume,
                market_cap, pe_ratio, dividend_yield, high_52w, low_52w, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (symbol) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, instruments.name),
                sector = COALESCE(EXCLUDED.sector, instruments.sector),
                last_price = COALESCE(EXCLUDED.last_price, instruments.last_price),
                change_amount = COALESCE(EXCLUDED.change_amount, instruments.change_amount),
                change_percent = COALESCE(EXCLUDED.change_percent, instruments.change_percent),
                volume = COALESCE(EXCLUDED.volume, instruments.volume),
                market_cap = COALESCE(EXCLUDED.market_cap, instruments.market_cap),
                pe_ratio = COALESCE(EXCLUDED.pe_ratio, instruments.pe_ratio),
                dividend_yield = COALESCE(EXCLUDED.dividend_yield, instruments.dividend_yield),
                high_52w = COALESCE(EXCLUDED.high_52w, instruments.high_52w),
                low_52w = COALESCE(EXCLUDED.low_52w, instruments.low_52w),
                updated_at = NOW()
            RETURNING {INSTRUMENT_COLUMNS}
            "#
        );

        let row = self
            .gateway
            .query(|pool| {
                let sql = sql.as_str();
                async move {
                    sqlx::query(sql)
                        .bind(&snapshot.symbol)
                        .bind(&snapshot.name)
                        .bind(&snapshot.sector)
                        .bind(snapshot.last_price)
                        .bind(snapshot.change_amount)
                        .bind(snapshot.change_percent)
                        .bind(snapshot.volume)
                        .bind(snapshot.market_cap)
                        .bind(snapshot.pe_ratio)
                        .bind(snapshot.dividend_yield)
                        .bind(snapshot.high_52w)
                        .bind(snapshot.low_52w)
                        .fetch_one(&pool)
                        .await
                }
            })
            .await?;

        Ok(instrument_from_row(&row)?)
    }

    async fn find_instrument(&self, symbol: &str) -> StorageResult<Option<Instrument>> {
        let sql = format!("SELECT {INSTRUMENT_COLUMNS} FROM instruments WHERE symbol = $1");

        let row = self
            .gateway
            .query(|pool| {
                let sql = sql.as_str();
                async move { sqlx::query(sql).bind(symbol).fetch_optional(&pool).await }
            })
            .await?;

        Ok(row.as_ref().map(instrument_from_row).transpose()?)
    }

    async fn insert_price_point(&self, point: &PricePoint) -> StorageResult<()> {
        self.gateway
            .query(|pool| async move {
                sqlx::query(UPSERT_PRICE_POINT)
                    .bind(point.instrument_id)
                    .bind(point.price)
                    .bind(point.volume)
                    .bind(point.timestamp)
                    .bind(point.source.as_str())
                    .execute(&pool)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn insert_aggregate_bar(&self, bar: &AggregateBar) -> StorageResult<()> {
        self.gateway
            .query(|pool| async move {
                sqlx::query(UPSERT_AGGREGATE_BAR)
                    .bind(bar.instrument_id)
                    .bind(bar.open)
                    .bind(bar.high)
                    .bind(bar.low)
                    .bind(bar.close)
                    .bind(bar.volume)
                    .bind(bar.vwap)
                    .bind(bar.timestamp)
                    .bind(bar.source.as_str())
                    .execute(&pool)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn price_timestamps(
        &self,
        instrument_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>> {
        let timestamps = self
            .gateway
            .query(|pool| async move {
                sqlx::query_scalar::<_, DateTime<Utc>>(
                    r#"
                    SELECT ts FROM price_points
                    WHERE instrument_id = $1 AND ts >= $2 AND ts <= $3
                    ORDER BY ts ASC
                    "#,
                )
                .bind(instrument_id)
                .bind(from)
                .bind(to)
                .fetch_all(&pool)
                .await
            })
            .await?;

        debug!(instrument_id, count = timestamps.len(), "Loaded price timestamps");
        Ok(timestamps)
    }

    async fn apply_repair(
        &self,
        instrument_id: i64,
        bars: &[HistoricalBar],
        write_aggregates: bool,
    ) -> StorageResult<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let written = self
            .gateway
            .with_transaction(|tx| {
                let points: Vec<PricePoint> = bars
                    .iter()
                    .map(|b| b.to_price_point(instrument_id, DataSource::Repair))
                    .collect();
                let aggregates: Vec<AggregateBar> = if write_aggregates {
                    bars.iter()
                        .map(|b| b.to_aggregate_bar(instrument_id, DataSource::Repair))
                        .collect()
                } else {
                    Vec::new()
                };

                Box::pin(async move {
                    for point in &points {
                        write_price_point(tx, point).await?;
                    }
                    for bar in &aggregates {
                        write_aggregate_bar(tx, bar).await?;
                    }
                    Ok(points.len() + aggregates.len())
                })
            })
            .await?;

        debug!(instrument_id, rows = written, "Applied repair batch");
        Ok(written)
    }

    async fn upsert_enrichment(
        &self,
        instrument_id: i64,
        record: &EnrichmentRecord,
    ) -> StorageResult<()> {
        self.gateway
            .query(|pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO fundamentals (instrument_id, report_date, report_type, payload, updated_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (instrument_id, report_date, report_type) DO UPDATE SET
                        payload = EXCLUDED.payload,
                        updated_at = NOW()
                    "#,
                )
                .bind(instrument_id)
                .bind(record.report_date)
                .bind(&record.report_type)
                .bind(&record.payload)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    async fn expired_ids(
        &self,
        table: SeriesTable,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> StorageResult<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM {} WHERE source = 'streaming' AND ts < $1 AND id > $2 \
             ORDER BY id ASC LIMIT $3",
            table.table_name()
        );

        let ids = self
            .gateway
            .query(|pool| {
                let sql = sql.as_str();
                async move {
                    sqlx::query_scalar::<_, i64>(sql)
                        .bind(cutoff)
                        .bind(after_id)
                        .bind(limit)
                        .fetch_all(&pool)
                        .await
                }
            })
            .await?;
        Ok(ids)
    }

    async fn delete_ids(&self, table: SeriesTable, ids: &[i64]) -> StorageResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", table.table_name());

        let result = self
            .gateway
            .query(|pool| {
                let sql = sql.as_str();
                async move { sqlx::query(sql).bind(ids).execute(&pool).await }
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.gateway.health_check().await
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        let instruments = self
            .gateway
            .query(|pool| async move {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM instruments")
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        let mut stats = StoreStats {
            instruments,
            ..Default::default()
        };

        for table in SeriesTable::ALL {
            let sql = format!(
                "SELECT source, COUNT(*) AS total FROM {} GROUP BY source ORDER BY source",
                table.table_name()
            );
            let rows = self
                .gateway
                .query(|pool| {
                    let sql = sql.as_str();
                    async move { sqlx::query(sql).fetch_all(&pool).await }
                })
                .await?;

            let counts = rows
                .iter()
                .map(|row| -> Result<(String, i64), sqlx::Error> {
                    Ok((row.try_get("source")?, row.try_get("total")?))
                })
                .collect::<Result<Vec<_>, _>>()?;

            match table {
                SeriesTable::PricePoints => stats.price_points = counts,
                SeriesTable::AggregateBars => stats.aggregate_bars = counts,
            }
        }

        stats.enrichment_records = self
            .gateway
            .query(|pool| async move {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM fundamentals")
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upserts_are_gated_on_source_rank() {
        for sql in [UPSERT_PRICE_POINT, UPSERT_AGGREGATE_BAR] {
            assert!(sql.contains("ON CONFLICT (instrument_id, ts) DO UPDATE"));
            assert!(sql.contains("WHERE source_rank(EXCLUDED.source) >= source_rank("));
        }
    }
}
