//! Error handling shared by the ingestion crates.
//!
//! This module provides:
//! - Common error types for storage and configuration failures
//! - The `ErrorClassification` trait used to drive retry decisions
//! - A generic `retry_with_backoff` helper
//!
//! # Usage
//!
//! ```rust,ignore
//! use market_common::error::{DatabaseError, ErrorClassification};
//!
//! fn should_retry(err: &DatabaseError) -> bool {
//!     err.is_transient() && err.max_retries() > 0
//! }
//! ```

mod common;
mod traits;

pub use common::*;
pub use traits::*;
