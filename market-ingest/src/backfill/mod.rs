//! Gap detection and repair
//!
//! The [`BackfillOrchestrator`] scans stored price history for uncovered spans,
//! refetches them from the upstream provider and writes the repairs through
//! the store. Jobs are tracked in memory for status polling.

mod orchestrator;

pub use orchestrator::*;

use market_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::provider::UpstreamError;
use crate::storage::StorageError;

/// Backfill error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackfillError {
    /// No symbols to scan
    #[error("No symbols to backfill")]
    NoSymbols,

    /// Every requested symbol is already covered by an active job
    #[error("Backfill already running for: {0}")]
    AlreadyRunning(String),

    /// Caller supplied a job id that is still tracked
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl ErrorClassification for BackfillError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackfillError::NoSymbols | BackfillError::InvalidRange(_) => ErrorCategory::Configuration,
            BackfillError::AlreadyRunning(_) | BackfillError::DuplicateJob(_) => {
                ErrorCategory::Permanent
            }
            BackfillError::Storage(e) => e.category(),
            BackfillError::Upstream(e) => e.category(),
        }
    }
}

pub type BackfillResult<T> = Result<T, BackfillError>;
