//! Serve command - run the ingestion service until interrupted

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::backfill::BackfillOrchestrator;
use crate::cli::{load_settings, Backends};
use crate::collector::{PollingCollector, StreamingCollector, StreamingConfig};
use crate::retention::RetentionCleanup;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Symbols to track (comma-separated), overrides symbols.tracked
    #[arg(long, short, value_delimiter = ',')]
    pub symbols: Option<Vec<String>>,

    /// Do not start the streaming collector
    #[arg(long)]
    pub no_streaming: bool,

    /// Do not start the polling collector
    #[arg(long)]
    pub no_polling: bool,

    /// Do not schedule backfill runs
    #[arg(long)]
    pub no_backfill: bool,

    /// Do not run retention cleanup
    #[arg(long)]
    pub no_retention: bool,

    /// Use the in-memory store and simulated provider; streaming stays off
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds between component stats log lines
    #[arg(long, default_value = "60")]
    pub stats_interval: u64,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs) -> Result<()> {
    let settings = load_settings(args.symbols.clone())?;
    let symbols = settings.symbols.tracked.clone();
    if symbols.is_empty() {
        error!("No symbols configured");
        return Err(anyhow::anyhow!("No symbols configured"));
    }

    info!("Starting market ingest service");
    info!("  Symbols: {}", symbols.join(","));
    info!("  Dry run: {}", args.dry_run);

    let backends = Backends::open(&settings, args.dry_run).await?;

    // Set up shutdown handling
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for ctrl+c: {}", e),
        }
        let _ = shutdown_tx_clone.send(());
    });

    let monitor = backends
        .gateway
        .as_ref()
        .map(|gateway| gateway.start_health_monitor(shutdown_tx.subscribe()));

    let streaming = if args.no_streaming || args.dry_run || !settings.streaming.enabled {
        info!("Streaming collector disabled");
        None
    } else if settings.upstream.api_key.is_empty() {
        warn!("No upstream API key configured, streaming collector disabled");
        None
    } else {
        let collector = Arc::new(StreamingCollector::new(
            Arc::clone(&backends.store),
            StreamingConfig::from_settings(&settings),
        ));
        collector.start();
        Some(collector)
    };

    let polling = if args.no_polling || !settings.polling.enabled {
        info!("Polling collector disabled");
        None
    } else {
        let collector = Arc::new(PollingCollector::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.upstream),
            symbols.clone(),
            settings.polling.clone(),
        ));
        collector.start();
        Some(collector)
    };

    let backfill = if args.no_backfill || !settings.backfill.enabled {
        info!("Scheduled backfill disabled");
        None
    } else {
        let orchestrator = Arc::new(BackfillOrchestrator::new(
            Arc::clone(&backends.store),
            Arc::clone(&backends.upstream),
            settings.backfill.clone(),
            symbols.clone(),
        ));
        orchestrator.start();
        Some(orchestrator)
    };

    let retention = if args.no_retention || !settings.retention.enabled {
        info!("Retention cleanup disabled");
        None
    } else {
        let cleanup = Arc::new(RetentionCleanup::new(
            Arc::clone(&backends.store),
            settings.retention.clone(),
        ));
        cleanup.start();
        Some(cleanup)
    };

    info!("Service running. Press Ctrl+C to stop.");

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut stats_ticker = interval(Duration::from_secs(args.stats_interval.max(1)));
    stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    stats_ticker.tick().await;

    loop {
        tokio::select! {
            _ = stats_ticker.tick() => {
                if let Some(rest) = &backends.rest {
                    let purged = rest.purge_expired();
                    let (hits, misses) = rest.cache_stats();
                    info!(purged, hits, misses, "Upstream cache stats");
                }
                if let Some(collector) = &streaming {
                    let stats = collector.stats();
                    info!(
                        state = %collector.state(),
                        messages = stats.messages_received,
                        trades = stats.trades_written,
                        bars = stats.bars_written,
                        unknown_symbols = stats.unknown_symbols,
                        reconnects = stats.reconnects,
                        "Streaming stats"
                    );
                }
                if let Some(collector) = &polling {
                    let stats = collector.stats();
                    info!(
                        collecting = collector.is_collecting(),
                        cycles = stats.cycles_completed,
                        skipped = stats.cycles_skipped,
                        stuck_resets = stats.stuck_resets,
                        written = stats.symbols_written,
                        failures = stats.symbol_failures,
                        "Polling stats"
                    );
                }
                if let Some(orchestrator) = &backfill {
                    info!(active_jobs = orchestrator.list_active_jobs().len(), "Backfill stats");
                }
                if let Some(cleanup) = &retention {
                    let stats = cleanup.stats();
                    info!(
                        passes = stats.passes_completed,
                        aborted = stats.passes_aborted,
                        rows_deleted = stats.rows_deleted,
                        "Retention stats"
                    );
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    if let Some(collector) = &streaming {
        collector.stop().await;
    }
    if let Some(collector) = &polling {
        collector.stop().await;
    }
    if let Some(orchestrator) = &backfill {
        orchestrator.stop().await;
    }
    if let Some(cleanup) = &retention {
        cleanup.stop().await;
    }
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            warn!("Health monitor ended abnormally: {}", e);
        }
    }
    backends.close().await;

    info!("Market ingest service stopped");
    Ok(())
}
