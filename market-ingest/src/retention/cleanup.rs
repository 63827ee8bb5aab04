//! Retention cleanup
//!
//! Deletes streaming rows older than the retention window. Rows are removed by
//! primary key in small batches: select the next ids above the last one seen,
//! delete exactly those, repeat until a batch comes back empty.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use market_common::error::retry_with_backoff;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RetentionSettings;
use crate::storage::{MarketStore, SeriesTable, StorageResult};

/// Outcome of one completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub price_points_deleted: u64,
    pub aggregate_bars_deleted: u64,
    pub batches: u64,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> u64 {
        self.price_points_deleted + self.aggregate_bars_deleted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    pub passes_completed: u64,
    pub passes_skipped: u64,
    pub passes_aborted: u64,
    pub rows_deleted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    passes_completed: AtomicU64,
    passes_skipped: AtomicU64,
    passes_aborted: AtomicU64,
    rows_deleted: AtomicU64,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetentionCleanup {
    store: Arc<dyn MarketStore>,
    settings: RetentionSettings,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl RetentionCleanup {
    pub fn new(store: Arc<dyn MarketStore>, settings: RetentionSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            settings,
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RetentionStats {
        let c = &self.counters;
        RetentionStats {
            passes_completed: c.passes_completed.load(Ordering::Relaxed),
            passes_skipped: c.passes_skipped.load(Ordering::Relaxed),
            passes_aborted: c.passes_aborted.load(Ordering::Relaxed),
            rows_deleted: c.rows_deleted.load(Ordering::Relaxed),
        }
    }

    fn try_begin_pass(&self) -> Option<PassGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(&self.running))
    }

    /// Run one pass with the cutoff at now minus the retention window.
    /// Returns `Ok(None)` when another pass is in progress.
    pub async fn run_once(&self) -> StorageResult<Option<CleanupReport>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.settings.window_minutes);
        self.run_with_cutoff(cutoff).await
    }

    pub async fn run_with_cutoff(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<CleanupReport>> {
        let Some(_guard) = self.try_begin_pass() else {
            self.counters.passes_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Retention pass already running, skipping");
            return Ok(None);
        };

        let mut report = CleanupReport {
            cutoff: Some(cutoff),
            ..CleanupReport::default()
        };

        for table in SeriesTable::ALL {
            match self.purge_table(table, cutoff, &mut report).await {
                Ok(deleted) => match table {
                    SeriesTable::PricePoints => report.price_points_deleted = deleted,
                    SeriesTable::AggregateBars => report.aggregate_bars_deleted = deleted,
                },
                Err(e) => {
                    self.counters.passes_aborted.fetch_add(1, Ordering::Relaxed);
                    error!(%table, error = %e, "Retention pass aborted");
                    return Err(e);
                }
            }
        }

        self.counters.passes_completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .rows_deleted
            .fetch_add(report.total_deleted(), Ordering::Relaxed);
        info!(
            cutoff = %cutoff,
            price_points = report.price_points_deleted,
            aggregate_bars = report.aggregate_bars_deleted,
            batches = report.batches,
            "Retention pass complete"
        );
        Ok(Some(report))
    }

    async fn purge_table(
        &self,
        table: SeriesTable,
        cutoff: DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> StorageResult<u64> {
        let attempts = self.settings.max_attempts.max(1);
        let backoff = Duration::from_millis(self.settings.initial_backoff_ms);
        let limit = self.settings.batch_size;

        let mut after_id = 0i64;
        let mut deleted = 0u64;

        loop {
            let ids = retry_with_backoff(
                || self.store.expired_ids(table, cutoff, after_id, limit),
                attempts,
                backoff,
            )
            .await?;

            let Some(&last_id) = ids.last() else {
                break;
            };

            let removed =
                retry_with_backoff(|| self.store.delete_ids(table, &ids), attempts, backoff).await?;
            if removed < ids.len() as u64 {
                // Rows can vanish between select and delete when another writer promotes them
                debug!(%table, selected = ids.len(), removed, "Batch partially deleted");
            }

            deleted += removed;
            report.batches += 1;
            after_id = last_id;
        }

        Ok(deleted)
    }

    /// Start the periodic pass loop
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Retention cleanup already running");
            return;
        }

        info!(
            interval_secs = self.settings.interval_secs,
            window_minutes = self.settings.window_minutes,
            batch_size = self.settings.batch_size,
            "Starting retention cleanup"
        );

        let cleanup = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(cleanup.settings.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pass = Arc::clone(&cleanup);
                        tokio::spawn(async move {
                            if let Err(e) = pass.run_once().await {
                                warn!(error = %e, "Retention pass failed, retrying next tick");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Retention cleanup shutting down");
                        break;
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!("Retention task ended abnormally: {}", e);
            }
        }
    }
}
