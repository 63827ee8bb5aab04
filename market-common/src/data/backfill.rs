//! Backfill job model
//!
//! A job is created when a repair run is triggered, mutated in place while
//! gaps are processed, and kept in memory after it reaches a terminal state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A span with no price coverage. Computed per run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Symbol with missing data
    pub symbol: String,
    /// First uncovered instant (inclusive)
    pub start: DateTime<Utc>,
    /// Last uncovered instant (inclusive)
    pub end: DateTime<Utc>,
}

impl Gap {
    pub fn new(symbol: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            start,
            end,
        }
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.span().num_minutes()
    }
}

/// One gap that could not be repaired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapError {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub message: String,
}

impl GapError {
    pub fn new(gap: &Gap, message: impl Into<String>) -> Self {
        Self {
            symbol: gap.symbol.clone(),
            start: gap.start,
            end: gap.end,
            message: message.into(),
        }
    }
}

/// Status of a backfill job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Job accepted, nothing scanned yet
    Running,
    /// Scanning stored history for gaps
    IdentifyingGaps,
    /// Fetching and writing repairs
    Processing,
    /// Run finished, possibly with per-gap errors
    Completed,
    /// A precondition failed before any gap could be attempted
    Failed,
}

impl BackfillStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackfillStatus::Completed | BackfillStatus::Failed)
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackfillStatus::Running => write!(f, "running"),
            BackfillStatus::IdentifyingGaps => write!(f, "identifying_gaps"),
            BackfillStatus::Processing => write!(f, "processing"),
            BackfillStatus::Completed => write!(f, "completed"),
            BackfillStatus::Failed => write!(f, "failed"),
        }
    }
}

/// In-memory record of one repair run.
///
/// `processed_gaps` only moves forward and never passes `total_gaps`.
/// `progress_percent` reaches 100 exactly when the status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: String,
    pub status: BackfillStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_gaps: usize,
    pub processed_gaps: usize,
    pub progress_percent: u8,
    pub errors: Vec<GapError>,
    /// Symbols this run covers
    pub symbols: Vec<String>,
    /// Reason for a `Failed` status
    pub failure: Option<String>,
}

impl BackfillJob {
    pub fn new(id: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            id: id.into(),
            status: BackfillStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            total_gaps: 0,
            processed_gaps: 0,
            progress_percent: 0,
            errors: Vec::new(),
            symbols,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn begin_gap_scan(&mut self) {
        if !self.is_terminal() {
            self.status = BackfillStatus::IdentifyingGaps;
        }
    }

    /// Records the gap count and moves into processing.
    pub fn begin_processing(&mut self, total_gaps: usize) {
        if self.is_terminal() {
            return;
        }
        self.total_gaps = total_gaps;
        self.processed_gaps = self.processed_gaps.min(total_gaps);
        self.status = BackfillStatus::Processing;
        self.refresh_progress();
    }

    /// Marks one more gap as handled, successful or not.
    pub fn advance(&mut self) {
        if self.processed_gaps < self.total_gaps {
            self.processed_gaps += 1;
        }
        self.refresh_progress();
    }

    pub fn record_error(&mut self, error: GapError) {
        self.errors.push(error);
    }

    pub fn complete(&mut self) {
        self.status = BackfillStatus::Completed;
        self.finish();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = BackfillStatus::Failed;
        self.failure = Some(reason.into());
        self.finish();
    }

    fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
        self.progress_percent = 100;
    }

    fn refresh_progress(&mut self) {
        if self.is_terminal() {
            self.progress_percent = 100;
            return;
        }
        self.progress_percent = if self.total_gaps == 0 {
            0
        } else {
            // Held below 100 until the job is terminal
            ((self.processed_gaps * 100) / self.total_gaps).min(99) as u8
        };
    }
}

/// Options for an on-demand backfill run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillOptions {
    /// Restrict the run to these symbols; `None` means every tracked symbol
    pub symbols: Option<Vec<String>>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Run even if another active job already covers a requested symbol
    pub force: bool,
    /// Caller-supplied job id; generated when absent
    pub job_id: Option<String>,
}

impl BackfillOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// The caller's id, or a fresh UUID.
    pub fn resolve_job_id(&self) -> String {
        self.job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Window for this run: explicit bounds, or the last `lookback` ending now.
    pub fn resolve_window(&self, lookback: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - lookback);
        (from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gap() -> Gap {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        Gap::new("AAPL", start, start + Duration::minutes(45))
    }

    #[test]
    fn test_status_display_and_terminal() {
        assert_eq!(BackfillStatus::IdentifyingGaps.to_string(), "identifying_gaps");
        assert!(BackfillStatus::Completed.is_terminal());
        assert!(BackfillStatus::Failed.is_terminal());
        assert!(!BackfillStatus::Processing.is_terminal());
        assert_eq!(
            serde_json::to_string(&BackfillStatus::IdentifyingGaps).unwrap(),
            "\"identifying_gaps\""
        );
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let mut job = BackfillJob::new("job-1", vec!["AAPL".to_string()]);
        job.begin_gap_scan();
        job.begin_processing(3);

        let mut last = job.processed_gaps;
        for _ in 0..5 {
            job.advance();
            assert!(job.processed_gaps >= last);
            assert!(job.processed_gaps <= job.total_gaps);
            last = job.processed_gaps;
        }
        assert_eq!(job.processed_gaps, 3);
        assert!(job.progress_percent < 100);

        job.complete();
        assert_eq!(job.progress_percent, 100);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_errors_do_not_stop_progress() {
        let mut job = BackfillJob::new("job-2", vec![]);
        job.begin_processing(2);
        job.record_error(GapError::new(&gap(), "timeout"));
        job.advance();
        assert_eq!(job.processed_gaps, 1);
        assert_eq!(job.progress_percent, 50);
        assert_eq!(job.errors[0].symbol, "AAPL");
    }

    #[test]
    fn test_failed_job_is_terminal_at_full_progress() {
        let mut job = BackfillJob::new("job-3", vec![]);
        job.fail("storage unavailable");
        assert_eq!(job.status, BackfillStatus::Failed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.failure.as_deref(), Some("storage unavailable"));

        // Late transitions are ignored once terminal
        job.begin_processing(4);
        assert_eq!(job.status, BackfillStatus::Failed);
        assert_eq!(job.total_gaps, 0);
    }

    #[test]
    fn test_options_resolution() {
        let to = Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap();
        let options = BackfillOptions::new()
            .with_range(to - Duration::days(2), to)
            .with_job_id("manual-1");
        assert_eq!(options.resolve_job_id(), "manual-1");
        assert_eq!(options.resolve_window(Duration::days(7)).0, to - Duration::days(2));

        let defaults = BackfillOptions::new();
        let (from, to) = defaults.resolve_window(Duration::days(7));
        assert_eq!(to - from, Duration::days(7));
        assert!(!defaults.resolve_job_id().is_empty());
    }

    #[test]
    fn test_gap_span() {
        assert_eq!(gap().duration_minutes(), 45);
    }
}
