//! Live collectors
//!
//! Both collectors write through the same [`MarketStore`](crate::storage::MarketStore)
//! and rely on its upsert discipline; neither coordinates with the other.

mod polling;
mod streaming;

pub use polling::*;
pub use streaming::*;

use market_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::provider::UpstreamError;
use crate::storage::StorageError;

/// Failure collecting a single symbol
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ErrorClassification for CollectorError {
    fn category(&self) -> ErrorCategory {
        match self {
            CollectorError::Upstream(e) => e.category(),
            CollectorError::Storage(e) => e.category(),
        }
    }
}
