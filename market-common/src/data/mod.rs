//! Market data model, gap detection and backfill job tracking.

pub mod backfill;
pub mod backfill_config;
pub mod gap_detection;
pub mod types;
