//! Command-line interface
//!
//! Provides CLI commands for the ingestion service.

pub mod backfill;
pub mod db;
pub mod serve;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::provider::{MockUpstream, RestClient, UpstreamApi};
use crate::storage::{schema, InMemoryMarketStore, MarketStore, PgMarketStore, StorageGateway};

/// Market data ingestion CLI
#[derive(Parser)]
#[command(name = "market-ingest")]
#[command(about = "Market data ingestion, gap repair and retention")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the collectors, scheduled backfill and retention cleanup
    Serve(serve::ServeArgs),
    /// Gap detection and repair
    #[command(subcommand)]
    Backfill(backfill::BackfillCommands),
    /// Database operations
    #[command(subcommand)]
    Db(db::DbCommands),
}

/// Load settings, apply the symbol override and validate.
pub(crate) fn load_settings(symbols: Option<Vec<String>>) -> Result<Settings> {
    let mut settings = Settings::load()?;
    if let Some(symbols) = symbols {
        settings.symbols.tracked = symbols;
    }
    settings.validate()?;
    Ok(settings)
}

/// Connect the gateway and bring the schema up to date
pub(crate) async fn connect_gateway(settings: &Settings) -> Result<Arc<StorageGateway>> {
    info!("Connecting to database...");
    let gateway = Arc::new(StorageGateway::postgres(
        &settings.database,
        settings.gateway.clone(),
    ));
    gateway.connect().await?;
    schema::run_migrations(&gateway).await?;
    info!("Database connected and migrations applied");
    Ok(gateway)
}

/// Storage and provider handles shared by the components of one process
pub(crate) struct Backends {
    pub store: Arc<dyn MarketStore>,
    pub upstream: Arc<dyn UpstreamApi>,
    /// The concrete client, for cache maintenance
    pub rest: Option<Arc<RestClient>>,
    pub gateway: Option<Arc<StorageGateway>>,
}

impl Backends {
    /// Dry runs use the in-memory store and the simulated provider.
    pub async fn open(settings: &Settings, dry_run: bool) -> Result<Self> {
        if dry_run {
            info!("Dry run: in-memory store and simulated provider");
            return Ok(Self {
                store: Arc::new(InMemoryMarketStore::new()),
                upstream: Arc::new(MockUpstream::new()),
                rest: None,
                gateway: None,
            });
        }

        let rest = Arc::new(RestClient::new(settings.upstream.clone())?);
        let gateway = connect_gateway(settings).await?;
        Ok(Self {
            store: Arc::new(PgMarketStore::new(Arc::clone(&gateway))),
            upstream: rest.clone(),
            rest: Some(rest),
            gateway: Some(gateway),
        })
    }

    pub async fn close(&self) {
        if let Some(gateway) = &self.gateway {
            gateway.close().await;
        }
    }
}
