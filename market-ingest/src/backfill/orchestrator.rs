//! Backfill orchestrator
//!
//! A run scans every requested symbol, collects all gaps into the job, then
//! repairs them one at a time with a fixed pause in between. A gap that fails
//! is recorded on the job and the run moves on; only a storage outage before
//! the first gap fails the job as a whole.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use market_common::{
    BackfillConfig, BackfillJob, BackfillOptions, Gap, GapDetector, GapError, Granularity,
    InstrumentSnapshot,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{BackfillError, BackfillResult};
use crate::provider::UpstreamApi;
use crate::storage::MarketStore;

/// A job accepted for execution
#[derive(Debug, Clone)]
struct JobPlan {
    id: String,
    symbols: Vec<String>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

pub struct BackfillOrchestrator {
    store: Arc<dyn MarketStore>,
    upstream: Arc<dyn UpstreamApi>,
    config: BackfillConfig,
    tracked: Vec<String>,
    detector: GapDetector,
    jobs: RwLock<HashMap<String, BackfillJob>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackfillOrchestrator {
    pub fn new(
        store: Arc<dyn MarketStore>,
        upstream: Arc<dyn UpstreamApi>,
        config: BackfillConfig,
        tracked: Vec<String>,
    ) -> Self {
        let detector = GapDetector::new(config.gap_detection());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            upstream,
            config,
            tracked,
            detector,
            jobs: RwLock::new(HashMap::new()),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    // =================================================================
    // Job queries
    // =================================================================

    /// Snapshot of one job
    pub fn get_backfill_status(&self, job_id: &str) -> Option<BackfillJob> {
        self.jobs.read().get(job_id).cloned()
    }

    /// Jobs not yet terminal, oldest first
    pub fn list_active_jobs(&self) -> Vec<BackfillJob> {
        let mut active: Vec<BackfillJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|job| job.started_at);
        active
    }

    /// Every tracked job, oldest first
    pub fn list_jobs(&self) -> Vec<BackfillJob> {
        let mut jobs: Vec<BackfillJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    // =================================================================
    // Triggers
    // =================================================================

    /// Accept a run and execute it in the background. Returns the job id.
    pub fn trigger_backfill(self: &Arc<Self>, options: BackfillOptions) -> BackfillResult<String> {
        let plan = self.register_job(&options)?;
        let job_id = plan.id.clone();

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(plan).await;
        });

        Ok(job_id)
    }

    /// Accept a run and execute it to completion. Returns the final job state.
    pub async fn run_backfill(&self, options: BackfillOptions) -> BackfillResult<BackfillJob> {
        let plan = self.register_job(&options)?;
        let job_id = plan.id.clone();
        self.execute(plan).await;

        self.get_backfill_status(&job_id)
            .ok_or_else(|| BackfillError::DuplicateJob(format!("{} was evicted", job_id)))
    }

    /// Validate options and insert a new job.
    ///
    /// Without `force`, symbols already covered by an active job are dropped
    /// from this run.
    fn register_job(&self, options: &BackfillOptions) -> BackfillResult<JobPlan> {
        let requested: Vec<String> = options
            .symbols
            .clone()
            .filter(|symbols| !symbols.is_empty())
            .unwrap_or_else(|| self.tracked.clone());
        if requested.is_empty() {
            return Err(BackfillError::NoSymbols);
        }

        let (from, to) = options.resolve_window(self.config.lookback());
        if from >= to {
            return Err(BackfillError::InvalidRange(format!("{} is not before {}", from, to)));
        }

        let job_id = options.resolve_job_id();
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job_id) {
            return Err(BackfillError::DuplicateJob(job_id));
        }

        let symbols = if options.force {
            requested
        } else {
            let busy: HashSet<&str> = jobs
                .values()
                .filter(|job| !job.is_terminal())
                .flat_map(|job| job.symbols.iter().map(String::as_str))
                .collect();
            let (free, skipped): (Vec<String>, Vec<String>) = requested
                .into_iter()
                .partition(|symbol| !busy.contains(symbol.as_str()));
            if free.is_empty() {
                return Err(BackfillError::AlreadyRunning(skipped.join(",")));
            }
            if !skipped.is_empty() {
                info!(skipped = ?skipped, "Skipping symbols with an active backfill");
            }
            free
        };

        jobs.insert(job_id.clone(), BackfillJob::new(job_id.clone(), symbols.clone()));
        info!(
            job_id = %job_id,
            symbols = symbols.len(),
            from = %from,
            to = %to,
            force = options.force,
            "Backfill job accepted"
        );

        Ok(JobPlan {
            id: job_id,
            symbols,
            from,
            to,
        })
    }

    fn update_job(&self, job_id: &str, update: impl FnOnce(&mut BackfillJob)) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            update(job);
        }
    }

    // =================================================================
    // Execution
    // =================================================================

    async fn execute(&self, plan: JobPlan) {
        let job_id = plan.id.as_str();
        self.update_job(job_id, |job| job.begin_gap_scan());

        if let Err(e) = self.store.health_check().await {
            error!(job_id, error = %e, "Storage unavailable, failing backfill job");
            self.update_job(job_id, |job| job.fail(format!("storage unavailable: {}", e)));
            self.evict_history();
            return;
        }

        let mut gaps: Vec<Gap> = Vec::new();
        for symbol in &plan.symbols {
            match self.detect_gaps(symbol, plan.from, plan.to).await {
                Ok(found) => {
                    debug!(job_id, symbol = %symbol, gaps = found.len(), "Scanned symbol");
                    gaps.extend(found);
                }
                Err(e) => {
                    warn!(job_id, symbol = %symbol, error = %e, "Gap scan failed");
                    let window = Gap::new(symbol.clone(), plan.from, plan.to);
                    self.update_job(job_id, |job| {
                        job.record_error(GapError::new(&window, format!("gap scan failed: {}", e)))
                    });
                }
            }
        }

        info!(job_id, total_gaps = gaps.len(), "Processing gaps");
        self.update_job(job_id, |job| job.begin_processing(gaps.len()));

        let delay = self.config.inter_gap_delay();
        for (index, gap) in gaps.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                sleep(delay).await;
            }

            match self.repair_gap(gap).await {
                Ok(written) => debug!(
                    job_id,
                    symbol = %gap.symbol,
                    start = %gap.start,
                    end = %gap.end,
                    written,
                    "Gap repaired"
                ),
                Err(e) => {
                    warn!(job_id, symbol = %gap.symbol, error = %e, "Gap repair failed");
                    self.update_job(job_id, |job| job.record_error(GapError::new(gap, e.to_string())));
                }
            }
            self.update_job(job_id, |job| job.advance());
        }

        self.update_job(job_id, |job| job.complete());
        if let Some(job) = self.get_backfill_status(job_id) {
            info!(
                job_id,
                processed = job.processed_gaps,
                errors = job.errors.len(),
                "Backfill job completed"
            );
        }
        self.evict_history();
    }

    /// Current gaps for one symbol in `[from, to]`. A symbol with no
    /// instrument row has no coverage at all.
    pub async fn detect_gaps(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BackfillResult<Vec<Gap>> {
        let timestamps = match self.store.find_instrument(symbol).await? {
            Some(instrument) => self.store.price_timestamps(instrument.id, from, to).await?,
            None => Vec::new(),
        };
        Ok(self.detector.detect_gaps(symbol, &timestamps, from, to))
    }

    async fn repair_gap(&self, gap: &Gap) -> BackfillResult<usize> {
        let granularity = Granularity::for_span(gap.span());
        let bars = self
            .upstream
            .get_historical_range(&gap.symbol, granularity, gap.start, gap.end)
            .await?;
        if bars.is_empty() {
            debug!(symbol = %gap.symbol, %granularity, "Provider returned no bars for gap");
            return Ok(0);
        }

        let instrument_id = self.ensure_instrument(&gap.symbol).await?;
        let written = self
            .store
            .apply_repair(instrument_id, &bars, !granularity.is_finest())
            .await?;
        Ok(written)
    }

    /// Instrument id for `symbol`, creating the row from its profile if needed
    async fn ensure_instrument(&self, symbol: &str) -> BackfillResult<i64> {
        if let Some(instrument) = self.store.find_instrument(symbol).await? {
            return Ok(instrument.id);
        }

        let mut snapshot = InstrumentSnapshot::new(symbol);
        match self.upstream.get_profile(symbol).await {
            Ok(profile) => {
                snapshot.name = profile.name;
                snapshot.sector = profile.sector;
                snapshot.market_cap = profile.market_cap;
            }
            Err(e) => debug!(symbol, error = %e, "Profile unavailable, creating bare instrument"),
        }

        let instrument = self.store.upsert_instrument(&snapshot).await?;
        info!(symbol, id = instrument.id, "Created instrument during backfill");
        Ok(instrument.id)
    }

    /// Drop the oldest terminal jobs beyond the history limit
    fn evict_history(&self) {
        let mut jobs = self.jobs.write();
        let mut terminal: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|job| job.is_terminal())
            .map(|job| (job.completed_at.unwrap_or(job.started_at), job.id.clone()))
            .collect();

        let limit = self.config.max_job_history;
        if terminal.len() <= limit {
            return;
        }

        terminal.sort();
        let excess = terminal.len() - limit;
        for (_, id) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
        debug!(evicted = excess, "Evicted backfill job history");
    }

    // =================================================================
    // Schedule
    // =================================================================

    /// Start the scheduled loop. The first run happens immediately.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Backfill scheduler already running");
            return;
        }

        info!(
            interval_minutes = self.config.schedule_interval_minutes,
            lookback_days = self.config.lookback_days,
            "Starting backfill scheduler"
        );

        let orchestrator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(orchestrator.config.schedule_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match orchestrator.trigger_backfill(BackfillOptions::new()) {
                            Ok(job_id) => debug!(job_id = %job_id, "Scheduled backfill triggered"),
                            Err(BackfillError::AlreadyRunning(_)) => {
                                debug!("Previous scheduled backfill still running")
                            }
                            Err(e) => warn!(error = %e, "Scheduled backfill not started"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Backfill scheduler shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the scheduled loop. Jobs already running finish on their own.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!("Backfill scheduler ended abnormally: {}", e);
            }
        }
    }
}
