//! # Market Common
//!
//! Shared building blocks for the market data ingestion service.
//!
//! ## Features
//!
//! - **Data model**: instruments, price points, aggregate bars and their source tags
//! - **Gap detection**: finds uncovered spans in stored price history
//! - **Backfill jobs**: in-memory job records with monotonic progress tracking
//! - **Errors**: classified error types with retry helpers
//! - **Logging**: environment-driven `tracing` subscriber setup
//!
//! ## Architecture
//!
//! ```text
//! market-common
//! ├── data/
//! │   ├── types.rs           # Instrument, PricePoint, AggregateBar, Granularity
//! │   ├── gap_detection.rs   # GapDetector
//! │   ├── backfill.rs        # Gap, BackfillJob, BackfillStatus
//! │   └── backfill_config.rs # BackfillConfig
//! ├── error/                 # DatabaseError, ErrorClassification, retry_with_backoff
//! └── logging/               # LogConfig, init_logging
//! ```

pub mod data;
pub mod error;
pub mod logging;

pub use data::backfill::{BackfillJob, BackfillOptions, BackfillStatus, Gap, GapError};
pub use data::backfill_config::BackfillConfig;
pub use data::gap_detection::{GapDetectionConfig, GapDetector};
pub use data::types::{
    AggregateBar, DataSource, EnrichmentRecord, Granularity, HistoricalBar, Instrument,
    InstrumentSnapshot, PricePoint,
};
pub use error::{ErrorCategory, ErrorClassification};
