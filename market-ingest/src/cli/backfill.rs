//! Backfill CLI commands
//!
//! - `run` - Detect and repair gaps, following the job until it finishes
//! - `gaps` - List gaps without repairing them

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use market_common::{BackfillOptions, BackfillStatus};
use tracing::{error, info, warn};

use crate::backfill::BackfillOrchestrator;
use crate::cli::{load_settings, Backends};

/// Backfill subcommands
#[derive(Subcommand)]
pub enum BackfillCommands {
    /// Detect and repair gaps
    Run(RunArgs),
    /// Show gaps without repairing them
    Gaps(GapsArgs),
}

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Symbols to repair (comma-separated), defaults to symbols.tracked
    #[arg(long, short, value_delimiter = ',')]
    pub symbols: Option<Vec<String>>,

    /// Window start (RFC 3339)
    #[arg(long)]
    pub from: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long)]
    pub to: Option<DateTime<Utc>>,

    /// Run even when another job covers the same symbols
    #[arg(long)]
    pub force: bool,

    /// Job id, defaults to a fresh UUID
    #[arg(long)]
    pub job_id: Option<String>,

    /// Use the in-memory store and simulated provider
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the gaps command
#[derive(Args)]
pub struct GapsArgs {
    /// Symbols to scan (comma-separated), defaults to symbols.tracked
    #[arg(long, short, value_delimiter = ',')]
    pub symbols: Option<Vec<String>>,

    /// Window start (RFC 3339)
    #[arg(long)]
    pub from: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long)]
    pub to: Option<DateTime<Utc>>,

    /// Days to scan back from the window end when --from is absent
    #[arg(long)]
    pub lookback_days: Option<i64>,

    /// Override the interior gap threshold in minutes
    #[arg(long)]
    pub threshold_minutes: Option<i64>,
}

/// Execute backfill commands
pub async fn execute(cmd: BackfillCommands) -> Result<()> {
    match cmd {
        BackfillCommands::Run(args) => execute_run(args).await,
        BackfillCommands::Gaps(args) => execute_gaps(args).await,
    }
}

async fn execute_run(args: RunArgs) -> Result<()> {
    let settings = load_settings(args.symbols.clone())?;
    let backends = Backends::open(&settings, args.dry_run).await?;

    let orchestrator = Arc::new(BackfillOrchestrator::new(
        Arc::clone(&backends.store),
        Arc::clone(&backends.upstream),
        settings.backfill.clone(),
        settings.symbols.tracked.clone(),
    ));

    let mut options = BackfillOptions::new().with_force(args.force);
    if let Some(symbols) = args.symbols {
        options = options.with_symbols(symbols);
    }
    if let Some(job_id) = args.job_id {
        options = options.with_job_id(job_id);
    }
    options.from = args.from;
    options.to = args.to;

    let job_id = orchestrator.trigger_backfill(options)?;
    info!("Started backfill job {}", job_id);

    let mut last_progress = None;
    let job = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let Some(job) = orchestrator.get_backfill_status(&job_id) else {
            backends.close().await;
            return Err(anyhow::anyhow!("Backfill job {} disappeared", job_id));
        };

        let progress = (job.status, job.processed_gaps, job.total_gaps);
        if last_progress != Some(progress) {
            info!(
                "  {} {}/{} gaps ({}%)",
                job.status, job.processed_gaps, job.total_gaps, job.progress_percent
            );
            last_progress = Some(progress);
        }

        if job.is_terminal() {
            break job;
        }
    };

    for gap_error in &job.errors {
        warn!(
            "  {} [{} - {}]: {}",
            gap_error.symbol, gap_error.start, gap_error.end, gap_error.message
        );
    }

    backends.close().await;

    match job.status {
        BackfillStatus::Failed => {
            let reason = job.failure.unwrap_or_else(|| "unknown".to_string());
            error!("Backfill job {} failed: {}", job.id, reason);
            Err(anyhow::anyhow!("Backfill failed: {}", reason))
        }
        _ => {
            info!(
                "Backfill job {} completed: {} gaps, {} errors",
                job.id,
                job.total_gaps,
                job.errors.len()
            );
            Ok(())
        }
    }
}

async fn execute_gaps(args: GapsArgs) -> Result<()> {
    let mut settings = load_settings(args.symbols.clone())?;
    if let Some(threshold) = args.threshold_minutes {
        settings.backfill.gap_threshold_minutes = threshold;
    }
    if let Some(days) = args.lookback_days {
        settings.backfill.lookback_days = days;
    }
    settings.backfill.validate().map_err(anyhow::Error::msg)?;

    let backends = Backends::open(&settings, false).await?;
    let orchestrator = BackfillOrchestrator::new(
        Arc::clone(&backends.store),
        Arc::clone(&backends.upstream),
        settings.backfill.clone(),
        settings.symbols.tracked.clone(),
    );

    let options = BackfillOptions {
        from: args.from,
        to: args.to,
        ..BackfillOptions::default()
    };
    let (from, to) = options.resolve_window(settings.backfill.lookback());
    info!("Scanning {} to {}", from, to);

    let mut total = 0;
    for symbol in &settings.symbols.tracked {
        let gaps = orchestrator.detect_gaps(symbol, from, to).await?;
        if gaps.is_empty() {
            info!("  {}: no gaps", symbol);
            continue;
        }
        info!("  {}: {} gaps", symbol, gaps.len());
        for gap in &gaps {
            info!(
                "    {} - {} ({} min)",
                gap.start,
                gap.end,
                gap.duration_minutes()
            );
        }
        total += gaps.len();
    }

    info!("Found {} gaps across {} symbols", total, settings.symbols.tracked.len());
    backends.close().await;
    Ok(())
}
