//! Schema migrations
//!
//! Idempotent: every statement uses `IF NOT EXISTS` or `OR REPLACE`, so
//! migrations run on each `serve` start and from `db migrate`.

use std::sync::Arc;

use tracing::{debug, info};

use super::error::StorageResult;
use super::gateway::StorageGateway;

/// Statements applied in order
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "instruments",
        r#"
        CREATE TABLE IF NOT EXISTS instruments (
            id BIGSERIAL PRIMARY KEY,
            symbol VARCHAR(32) NOT NULL UNIQUE,
            name TEXT,
            sector TEXT,
            last_price NUMERIC(20, 6),
            change_amount NUMERIC(20, 6),
            change_percent NUMERIC(12, 6),
            volume BIGINT,
            market_cap NUMERIC(24, 2),
            pe_ratio NUMERIC(14, 4),
            dividend_yield NUMERIC(10, 6),
            high_52w NUMERIC(20, 6),
            low_52w NUMERIC(20, 6),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "source_rank",
        r#"
        CREATE OR REPLACE FUNCTION source_rank(source TEXT) RETURNS INT
        LANGUAGE SQL IMMUTABLE AS $$
            SELECT CASE source WHEN 'repair' THEN 2 WHEN 'polling' THEN 1 ELSE 0 END
        $$
        "#,
    ),
    (
        "price_points",
        r#"
        CREATE TABLE IF NOT EXISTS price_points (
            id BIGSERIAL PRIMARY KEY,
            instrument_id BIGINT NOT NULL REFERENCES instruments (id),
            price NUMERIC(20, 6) NOT NULL,
            volume BIGINT NOT NULL DEFAULT 0,
            ts TIMESTAMPTZ NOT NULL,
            source VARCHAR(16) NOT NULL,
            CONSTRAINT price_points_instrument_ts UNIQUE (instrument_id, ts)
        )
        "#,
    ),
    (
        "idx_price_points_source_ts",
        "CREATE INDEX IF NOT EXISTS idx_price_points_source_ts ON price_points (source, ts)",
    ),
    (
        "aggregate_bars",
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_bars (
            id BIGSERIAL PRIMARY KEY,
            instrument_id BIGINT NOT NULL REFERENCES instruments (id),
            open NUMERIC(20, 6) NOT NULL,
            high NUMERIC(20, 6) NOT NULL,
            low NUMERIC(20, 6) NOT NULL,
            close NUMERIC(20, 6) NOT NULL,
            volume BIGINT NOT NULL DEFAULT 0,
            vwap NUMERIC(20, 6),
            ts TIMESTAMPTZ NOT NULL,
            source VARCHAR(16) NOT NULL,
            CONSTRAINT aggregate_bars_instrument_ts UNIQUE (instrument_id, ts)
        )
        "#,
    ),
    (
        "idx_aggregate_bars_source_ts",
        "CREATE INDEX IF NOT EXISTS idx_aggregate_bars_source_ts ON aggregate_bars (source, ts)",
    ),
    (
        "fundamentals",
        r#"
        CREATE TABLE IF NOT EXISTS fundamentals (
            instrument_id BIGINT NOT NULL REFERENCES instruments (id),
            report_date DATE NOT NULL,
            report_type VARCHAR(32) NOT NULL,
            payload JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (instrument_id, report_date, report_type)
        )
        "#,
    ),
];

/// Apply every migration through the gateway
pub async fn run_migrations(gateway: &Arc<StorageGateway>) -> StorageResult<()> {
    info!("Running schema migrations...");

    for (name, statement) in MIGRATIONS {
        gateway
            .query(|pool| async move { sqlx::query(statement).execute(&pool).await })
            .await?;
        debug!(migration = name, "Applied");
    }

    info!(count = MIGRATIONS.len(), "Schema migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent_statements() {
        for (name, statement) in MIGRATIONS {
            assert!(
                statement.contains("IF NOT EXISTS") || statement.contains("OR REPLACE"),
                "migration {name} must be idempotent"
            );
        }
    }

    #[test]
    fn test_series_tables_enforce_natural_key() {
        let find = |name: &str| {
            MIGRATIONS
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, sql)| *sql)
                .unwrap()
        };
        assert!(find("price_points").contains("UNIQUE (instrument_id, ts)"));
        assert!(find("aggregate_bars").contains("UNIQUE (instrument_id, ts)"));
        assert!(find("instruments").contains("symbol VARCHAR(32) NOT NULL UNIQUE"));
    }
}
