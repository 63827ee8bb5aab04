//! Database management commands

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::info;

use crate::cli::{connect_gateway, load_settings};
use crate::retention::RetentionCleanup;
use crate::storage::{MarketStore, PgMarketStore};

/// Database subcommands
#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
    /// Show row counts per table and source
    Stats,
    /// Run one retention pass now
    Cleanup(CleanupArgs),
}

/// Arguments for cleanup command
#[derive(Args)]
pub struct CleanupArgs {
    /// Delete streaming rows older than N minutes, overrides retention.window_minutes
    #[arg(long)]
    pub older_than: Option<i64>,

    /// Rows per delete batch, overrides retention.batch_size
    #[arg(long)]
    pub batch_size: Option<i64>,
}

/// Execute database commands
pub async fn execute(cmd: DbCommands) -> Result<()> {
    match cmd {
        DbCommands::Migrate => execute_migrate().await,
        DbCommands::Stats => execute_stats().await,
        DbCommands::Cleanup(args) => execute_cleanup(args).await,
    }
}

async fn execute_migrate() -> Result<()> {
    let settings = load_settings(None)?;
    // Migrations run as part of connecting
    let gateway = connect_gateway(&settings).await?;
    gateway.close().await;
    info!("Migrations completed");
    Ok(())
}

async fn execute_stats() -> Result<()> {
    let settings = load_settings(None)?;
    let gateway = connect_gateway(&settings).await?;
    let store = PgMarketStore::new(Arc::clone(&gateway));

    info!("Fetching database statistics...");
    let stats = store.stats().await?;

    info!("Database Statistics:");
    info!("  Instruments: {}", stats.instruments);
    info!("  Price points:");
    for (source, rows) in &stats.price_points {
        info!("    {}: {}", source, rows);
    }
    info!("  Aggregate bars:");
    for (source, rows) in &stats.aggregate_bars {
        info!("    {}: {}", source, rows);
    }
    info!("  Enrichment records: {}", stats.enrichment_records);

    gateway.close().await;
    Ok(())
}

async fn execute_cleanup(args: CleanupArgs) -> Result<()> {
    let mut settings = load_settings(None)?;
    if let Some(minutes) = args.older_than {
        if minutes <= 0 {
            return Err(anyhow::anyhow!("--older-than must be greater than 0"));
        }
        settings.retention.window_minutes = minutes;
    }
    if let Some(batch_size) = args.batch_size {
        if batch_size <= 0 {
            return Err(anyhow::anyhow!("--batch-size must be greater than 0"));
        }
        settings.retention.batch_size = batch_size;
    }

    let gateway = connect_gateway(&settings).await?;
    let store: Arc<dyn MarketStore> = Arc::new(PgMarketStore::new(Arc::clone(&gateway)));
    let cleanup = RetentionCleanup::new(store, settings.retention.clone());

    info!(
        "Deleting streaming rows older than {} minutes...",
        settings.retention.window_minutes
    );
    let result = cleanup.run_once().await;
    gateway.close().await;

    match result? {
        Some(report) => info!(
            "Deleted {} price points and {} aggregate bars in {} batches",
            report.price_points_deleted, report.aggregate_bars_deleted, report.batches
        ),
        None => info!("Another pass is already running"),
    }
    Ok(())
}
