//! PostgreSQL Store Tests
//!
//! Runs the SQL behind `PgMarketStore` against a real database.
//!
//! These tests are ignored by default. Set `DATABASE_URL` and run with:
//! `cargo test -p market-ingest --test postgres_store_test -- --ignored`

use std::collections::HashSet;
use std::env;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use market_common::{AggregateBar, DataSource, HistoricalBar, InstrumentSnapshot, PricePoint};
use market_ingest::config::{DatabaseSettings, GatewaySettings};
use market_ingest::storage::{
    schema, MarketStore, PgMarketStore, SeriesTable, StorageError, StorageGateway,
};
use rust_decimal_macros::dec;
use sqlx::Row;

async fn create_store() -> (Arc<StorageGateway>, PgMarketStore) {
    dotenv::dotenv().ok();
    let url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let database = DatabaseSettings {
        url,
        max_connections: 2,
        min_connections: 0,
        acquire_timeout_secs: 10,
    };

    let gateway = Arc::new(StorageGateway::postgres(&database, GatewaySettings::default()));
    gateway.connect().await.expect("Failed to connect to database");
    schema::run_migrations(&gateway)
        .await
        .expect("Failed to run migrations");
    let store = PgMarketStore::new(Arc::clone(&gateway));
    (gateway, store)
}

/// Unique per run so parallel tests never share rows
fn test_symbol(prefix: &str) -> String {
    format!("{}_{}", prefix, Utc::now().timestamp_micros() % 1_000_000_000)
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 3, 14, minute, 0).unwrap()
}

async fn cleanup(gateway: &StorageGateway, instrument_id: i64) {
    for sql in [
        "DELETE FROM price_points WHERE instrument_id = $1",
        "DELETE FROM aggregate_bars WHERE instrument_id = $1",
        "DELETE FROM fundamentals WHERE instrument_id = $1",
        "DELETE FROM instruments WHERE id = $1",
    ] {
        gateway
            .query(|pool| async move {
                sqlx::query(sql).bind(instrument_id).execute(&pool).await
            })
            .await
            .unwrap();
    }
}

async fn rows_by_source(gateway: &StorageGateway, instrument_id: i64) -> Vec<(i64, String)> {
    gateway
        .query(|pool| async move {
            sqlx::query("SELECT id, source FROM price_points WHERE instrument_id = $1 ORDER BY id")
                .bind(instrument_id)
                .fetch_all(&pool)
                .await
        })
        .await
        .unwrap()
        .iter()
        .map(|row| (row.get("id"), row.get("source")))
        .collect()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_lower_priority_upsert_keeps_stored_values() {
    let (gateway, store) = create_store().await;
    let instrument = store
        .upsert_instrument(&InstrumentSnapshot::new(test_symbol("PREC")))
        .await
        .unwrap();
    let id = instrument.id;

    // streaming(100) then polling(101) keeps the polled value
    store
        .insert_price_point(&PricePoint::new(id, dec!(100), 5, at(10), DataSource::Streaming))
        .await
        .unwrap();
    store
        .insert_price_point(&PricePoint::new(id, dec!(101), 7, at(10), DataSource::Polling))
        .await
        .unwrap();

    // repair, then a late streaming tick at the same timestamp
    let bar = HistoricalBar {
        timestamp: at(20),
        open: dec!(149),
        high: dec!(151),
        low: dec!(148),
        close: dec!(150),
        volume: 900,
        vwap: Some(dec!(150)),
    };
    assert_eq!(store.apply_repair(id, &[bar], true).await.unwrap(), 2);
    store
        .insert_price_point(&PricePoint::new(id, dec!(1), 1, at(20), DataSource::Streaming))
        .await
        .unwrap();
    store
        .insert_aggregate_bar(&AggregateBar {
            instrument_id: id,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: 1,
            vwap: None,
            timestamp: at(20),
            source: DataSource::Streaming,
        })
        .await
        .unwrap();

    let rows = gateway
        .query(|pool| async move {
            sqlx::query(
                "SELECT price, volume, source FROM price_points WHERE instrument_id = $1 ORDER BY ts",
            )
            .bind(id)
            .fetch_all(&pool)
            .await
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let polled: rust_decimal::Decimal = rows[0].get("price");
    assert_eq!(polled, dec!(101));
    assert_eq!(rows[0].get::<String, _>("source"), "polling");

    let repaired: rust_decimal::Decimal = rows[1].get("price");
    assert_eq!(repaired, dec!(150));
    assert_eq!(rows[1].get::<i64, _>("volume"), 900);
    assert_eq!(rows[1].get::<String, _>("source"), "repair");

    let close: rust_decimal::Decimal = gateway
        .query(|pool| async move {
            sqlx::query_scalar("SELECT close FROM aggregate_bars WHERE instrument_id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
        })
        .await
        .unwrap();
    assert_eq!(close, dec!(150));

    cleanup(&gateway, id).await;
    gateway.close().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_expired_ids_page_past_previous_batch() {
    let (gateway, store) = create_store().await;
    let id = store
        .upsert_instrument(&InstrumentSnapshot::new(test_symbol("PAGE")))
        .await
        .unwrap()
        .id;

    for minute in 0..5 {
        store
            .insert_price_point(&PricePoint::new(id, dec!(10), 1, at(minute), DataSource::Streaming))
            .await
            .unwrap();
    }
    store
        .insert_price_point(&PricePoint::new(id, dec!(10), 1, at(30), DataSource::Polling))
        .await
        .unwrap();

    let rows = rows_by_source(&gateway, id).await;
    let streaming: HashSet<i64> = rows
        .iter()
        .filter(|(_, source)| source == "streaming")
        .map(|(row_id, _)| *row_id)
        .collect();
    let polling: Vec<i64> = rows
        .iter()
        .filter(|(_, source)| source == "polling")
        .map(|(row_id, _)| *row_id)
        .collect();
    assert_eq!(streaming.len(), 5);

    // Other instruments may hold expired rows too, so only ordering and
    // membership are checked
    let cutoff = Utc.with_ymd_and_hms(2000, 1, 4, 0, 0, 0).unwrap();
    let mut after_id = streaming.iter().min().copied().unwrap_or(0) - 1;
    let mut seen = Vec::new();
    loop {
        let page = store
            .expired_ids(SeriesTable::PricePoints, cutoff, after_id, 2)
            .await
            .unwrap();
        let Some(last) = page.last().copied() else {
            break;
        };
        assert!(page.len() <= 2);
        assert!(page.iter().all(|row_id| *row_id > after_id));
        seen.extend(page);
        after_id = last;
        if streaming.iter().all(|row_id| seen.contains(row_id)) {
            break;
        }
    }
    assert!(streaming.iter().all(|row_id| seen.contains(row_id)));
    assert!(!seen.contains(&polling[0]));

    let ours: Vec<i64> = streaming.iter().copied().collect();
    let deleted = store
        .delete_ids(SeriesTable::PricePoints, &ours)
        .await
        .unwrap();
    assert_eq!(deleted, 5);
    assert_eq!(rows_by_source(&gateway, id).await, vec![(polling[0], "polling".to_string())]);

    cleanup(&gateway, id).await;
    gateway.close().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_transaction_rolls_back() {
    let (gateway, store) = create_store().await;
    let symbol = test_symbol("TXN");

    let result: Result<(), StorageError> = gateway
        .with_transaction(|tx| {
            let symbol = symbol.clone();
            Box::pin(async move {
                sqlx::query("INSERT INTO instruments (symbol) VALUES ($1)")
                    .bind(symbol)
                    .execute(&mut **tx)
                    .await?;
                Err(sqlx::Error::RowNotFound)
            })
        })
        .await;

    assert!(result.is_err());
    assert!(store.find_instrument(&symbol).await.unwrap().is_none());
    gateway.close().await;
}
