//! Logging configuration and initialization.

use std::env;

use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

type InitResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-field output
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// Newline-delimited JSON for log aggregation
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Timestamp format for log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Local time with timezone (default)
    #[default]
    Local,
    /// UTC time (ISO 8601)
    Utc,
    /// No timestamps
    None,
}

impl TimestampFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "utc" => TimestampFormat::Utc,
            "none" | "off" => TimestampFormat::None,
            _ => TimestampFormat::Local,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub timestamps: TimestampFormat,
    /// Filter used when `RUST_LOG` is not set
    pub default_level: String,
    /// Include source file and line
    pub include_location: bool,
    pub include_thread_ids: bool,
    /// Include target (module path)
    pub include_target: bool,
    /// Reported once at startup so aggregated logs can be told apart
    pub app_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            timestamps: TimestampFormat::Local,
            default_level: "info".to_string(),
            include_location: false,
            include_thread_ids: false,
            include_target: true,
            app_name: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|s| s == "true" || s == "1")
        .unwrap_or(default)
}

impl LogConfig {
    /// Create config from environment variables
    ///
    /// Reads `LOG_FORMAT`, `LOG_TIMESTAMPS`, `LOG_LEVEL`, `LOG_LOCATION`,
    /// `LOG_THREAD_IDS` and `LOG_APP_NAME`.
    pub fn from_env() -> Self {
        Self {
            format: env::var("LOG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
            timestamps: env::var("LOG_TIMESTAMPS")
                .map(|s| TimestampFormat::parse(&s))
                .unwrap_or_default(),
            default_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            include_location: env_flag("LOG_LOCATION", false),
            include_thread_ids: env_flag("LOG_THREAD_IDS", false),
            include_target: true,
            app_name: env::var("LOG_APP_NAME").ok(),
        }
    }

    /// JSON output with UTC timestamps, suited to log shipping.
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            timestamps: TimestampFormat::Utc,
            include_location: true,
            include_thread_ids: true,
            ..Default::default()
        }
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        if self.app_name.is_none() {
            self.app_name = Some(name.into());
        }
        self
    }

    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> InitResult {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let base = fmt::layer()
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let layer = match (config.format, config.timestamps) {
        (LogFormat::Json, TimestampFormat::None) => base.json().without_time().boxed(),
        (LogFormat::Json, TimestampFormat::Local) => base
            .json()
            .with_timer(ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.3f%:z".to_string()))
            .boxed(),
        (LogFormat::Json, TimestampFormat::Utc) => base
            .json()
            .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
            .boxed(),
        (format, timestamps) => {
            let base = base.with_ansi(atty::is(atty::Stream::Stdout));
            let compact = format == LogFormat::Compact;
            match (compact, timestamps) {
                (true, TimestampFormat::None) => base.compact().without_time().boxed(),
                (true, TimestampFormat::Utc) => base
                    .compact()
                    .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
                    .boxed(),
                (true, TimestampFormat::Local) => base
                    .compact()
                    .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f %z".to_string()))
                    .boxed(),
                (false, TimestampFormat::None) => base.without_time().boxed(),
                (false, TimestampFormat::Utc) => base
                    .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
                    .boxed(),
                (false, TimestampFormat::Local) => base
                    .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f %z".to_string()))
                    .boxed(),
            }
        }
    };

    registry.with(layer).try_init()?;

    if let Some(app) = &config.app_name {
        tracing::info!(app = %app, format = ?config.format, "Logging initialized");
    }

    Ok(())
}
