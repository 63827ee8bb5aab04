//! Market Ingest CLI
//!
//! Provides commands for:
//! - `serve`: Run the collectors, scheduled backfill and retention cleanup
//! - `backfill`: Detect and repair gaps on demand
//! - `db`: Database operations

use anyhow::Result;
use clap::Parser;
use market_common::logging::{init_logging, LogConfig};

use market_ingest::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    init_logging(LogConfig::from_env().with_app_name("market-ingest"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            market_ingest::cli::serve::execute(args).await?;
        }
        Commands::Backfill(cmd) => {
            market_ingest::cli::backfill::execute(cmd).await?;
        }
        Commands::Db(cmd) => {
            market_ingest::cli::db::execute(cmd).await?;
        }
    }

    Ok(())
}
