//! Polling collector
//!
//! On every tick the tracked symbols are fetched in fixed-size batches. Members
//! of a batch run concurrently and the batch settles completely before the
//! next one starts. A failed symbol is skipped until the next cycle.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use market_common::{AggregateBar, DataSource, InstrumentSnapshot, PricePoint};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::CollectorError;
use crate::config::PollingSettings;
use crate::provider::{Profile, Snapshot, UpstreamApi};
use crate::storage::MarketStore;

/// Result of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub symbols: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub enrichment_records: usize,
    pub batches: usize,
}

/// Point-in-time copy of the collector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollingStats {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub stuck_resets: u64,
    pub symbols_written: u64,
    pub symbol_failures: u64,
    pub enrichment_records: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles_completed: AtomicU64,
    cycles_skipped: AtomicU64,
    stuck_resets: AtomicU64,
    symbols_written: AtomicU64,
    symbol_failures: AtomicU64,
    enrichment_records: AtomicU64,
}

/// The cycle currently holding the collecting flag
#[derive(Debug, Clone, Copy)]
struct ActiveCycle {
    id: u64,
    started: Instant,
}

/// Releases the collecting flag, unless a newer cycle has taken it over
struct CycleGuard<'a> {
    collector: &'a PollingCollector,
    id: u64,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.collector.active.lock();
        if active.map(|cycle| cycle.id) == Some(self.id) {
            *active = None;
        }
    }
}

pub struct PollingCollector {
    store: Arc<dyn MarketStore>,
    upstream: Arc<dyn UpstreamApi>,
    symbols: Vec<String>,
    settings: PollingSettings,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    active: Mutex<Option<ActiveCycle>>,
    next_cycle_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl PollingCollector {
    pub fn new(
        store: Arc<dyn MarketStore>,
        upstream: Arc<dyn UpstreamApi>,
        symbols: Vec<String>,
        settings: PollingSettings,
    ) -> Self {
        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            upstream,
            symbols,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            settings,
            active: Mutex::new(None),
            next_cycle_id: AtomicU64::new(1),
            shutdown_tx,
            task: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn stats(&self) -> PollingStats {
        let c = &self.counters;
        PollingStats {
            cycles_completed: c.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: c.cycles_skipped.load(Ordering::Relaxed),
            stuck_resets: c.stuck_resets.load(Ordering::Relaxed),
            symbols_written: c.symbols_written.load(Ordering::Relaxed),
            symbol_failures: c.symbol_failures.load(Ordering::Relaxed),
            enrichment_records: c.enrichment_records.load(Ordering::Relaxed),
        }
    }

    /// Spawn the tick loop. Each tick spawns its own cycle; the collecting flag
    /// keeps cycles from overlapping.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Polling collector already running");
            return;
        }

        info!(
            symbols = self.symbols.len(),
            interval_secs = self.settings.interval_secs,
            batch_size = self.settings.batch_size,
            "Starting polling collector"
        );

        let collector = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(collector.settings.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cycle = Arc::clone(&collector);
                        tokio::spawn(async move {
                            cycle.run_cycle().await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Polling collector shutting down");
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
                warn!("Polling task ended abnormally: {}", e);
            }
            info!(stats = ?self.stats(), "Polling collector stopped");
        }
    }

    /// Take the collecting flag. A holder older than the stuck ceiling is
    /// assumed dead and replaced; a slow but live cycle can then overlap with
    /// the new one.
    fn try_begin_cycle(&self) -> Option<CycleGuard<'_>> {
        let stuck_after = Duration::from_secs(self.settings.stuck_after_secs);
        let mut active = self.active.lock();

        if let Some(cycle) = *active {
            let elapsed = cycle.started.elapsed();
            if elapsed < stuck_after {
                return None;
            }
            self.counters.stuck_resets.fetch_add(1, Ordering::Relaxed);
            warn!(
                cycle = cycle.id,
                elapsed_secs = elapsed.as_secs(),
                "Polling cycle still marked active past ceiling, force clearing"
            );
        }

        let id = self.next_cycle_id.fetch_add(1, Ordering::Relaxed);
        *active = Some(ActiveCycle {
            id,
            started: Instant::now(),
        });
        Some(CycleGuard {
            collector: self,
            id,
        })
    }

    /// Run one cycle over every tracked symbol. Returns `None` when another
    /// cycle holds the collecting flag.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Some(_guard) = self.try_begin_cycle() else {
            self.counters.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Previous polling cycle still running, skipping tick");
            return None;
        };

        let started = Instant::now();
        let batch_size = self.settings.batch_size.max(1);
        let batch_pause = Duration::from_millis(self.settings.batch_pause_ms);
        let mut report = CycleReport {
            symbols: self.symbols.len(),
            ..CycleReport::default()
        };

        for (index, batch) in self.symbols.chunks(batch_size).enumerate() {
            if index > 0 {
                sleep(batch_pause).await;
            }

            let results = join_all(batch.iter().map(|symbol| self.collect_symbol(symbol))).await;
            for (symbol, result) in batch.iter().zip(results) {
                match result {
                    Ok(enriched) => {
                        report.succeeded += 1;
                        report.enrichment_records += enriched;
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(symbol = %symbol, error = %e, "Skipping symbol for this cycle");
                    }
                }
            }
            report.batches += 1;
        }

        let c = &self.counters;
        c.cycles_completed.fetch_add(1, Ordering::Relaxed);
        c.symbols_written.fetch_add(report.succeeded as u64, Ordering::Relaxed);
        c.symbol_failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        c.enrichment_records
            .fetch_add(report.enrichment_records as u64, Ordering::Relaxed);

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            batches = report.batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Polling cycle complete"
        );
        Some(report)
    }

    /// Fetch and store one symbol. Returns the number of enrichment records written.
    async fn collect_symbol(&self, symbol: &str) -> Result<usize, CollectorError> {
        self.limiter.until_ready().await;
        let snapshot = self.upstream.get_snapshot(symbol).await?;

        self.limiter.until_ready().await;
        let profile = match self.upstream.get_profile(symbol).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                debug!(symbol, error = %e, "Profile unavailable, storing snapshot only");
                None
            }
        };

        // Instrument first so the observations below always have a parent row
        let instrument = self
            .store
            .upsert_instrument(&instrument_snapshot(&snapshot, profile.as_ref()))
            .await?;

        let point = PricePoint::new(
            instrument.id,
            snapshot.price,
            snapshot.trade_size,
            snapshot.timestamp,
            DataSource::Polling,
        );
        self.store.insert_price_point(&point).await?;
        self.store
            .insert_aggregate_bar(&snapshot_bar(&snapshot, instrument.id))
            .await?;

        if !self.settings.enrichment {
            return Ok(0);
        }
        self.store_enrichment(symbol, instrument.id).await
    }

    async fn store_enrichment(&self, symbol: &str, instrument_id: i64) -> Result<usize, CollectorError> {
        self.limiter.until_ready().await;
        let records = match self.upstream.get_fundamentals(symbol).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!(symbol, "No enrichment data");
                return Ok(0);
            }
            Err(e) => {
                warn!(symbol, error = %e, "Enrichment fetch failed");
                return Ok(0);
            }
        };

        for record in &records {
            self.store.upsert_enrichment(instrument_id, record).await?;
        }
        Ok(records.len())
    }
}

fn instrument_snapshot(snapshot: &Snapshot, profile: Option<&Profile>) -> InstrumentSnapshot {
    let mut instrument = InstrumentSnapshot::new(snapshot.symbol.clone()).with_price(snapshot.price);
    instrument.change_amount = snapshot.change_amount;
    instrument.change_percent = snapshot.change_percent;
    instrument.volume = snapshot.volume;

    if let Some(profile) = profile {
        instrument.name = profile.name.clone();
        instrument.sector = profile.sector.clone();
        instrument.market_cap = profile.market_cap;
        instrument.pe_ratio = profile.pe_ratio;
        instrument.dividend_yield = profile.dividend_yield;
        instrument.high_52w = profile.high_52w;
        instrument.low_52w = profile.low_52w;
    }
    instrument
}

/// The snapshot's minute bar, or a flat bar at the trade price when absent
fn snapshot_bar(snapshot: &Snapshot, instrument_id: i64) -> AggregateBar {
    match &snapshot.minute_bar {
        Some(bar) => bar.to_aggregate_bar(instrument_id, DataSource::Polling),
        None => AggregateBar {
            instrument_id,
            open: snapshot.price,
            high: snapshot.price,
            low: snapshot.price,
            close: snapshot.price,
            volume: snapshot.trade_size,
            vwap: None,
            timestamp: snapshot.timestamp,
            source: DataSource::Polling,
        },
    }
}
