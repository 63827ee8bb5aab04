//! Application settings and configuration

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use market_common::data::backfill_config::BackfillConfig;
use market_common::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// Storage gateway retry and health-check behavior
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Upstream provider endpoints and credentials
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Streaming collector settings
    #[serde(default)]
    pub streaming: StreamingSettings,
    /// Polling collector settings
    #[serde(default)]
    pub polling: PollingSettings,
    /// Backfill configuration
    #[serde(default)]
    pub backfill: BackfillConfig,
    /// Retention cleanup settings
    #[serde(default)]
    pub retention: RetentionSettings,
    /// Tracked symbols
    #[serde(default)]
    pub symbols: SymbolSettings,
}

// =================================================================
// Database
// =================================================================

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Seconds to wait for a free connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Storage gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Attempts per operation before a transient error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed wait before reconnecting and retrying
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Health check interval
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_health_check_interval() -> u64 {
    30
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl GatewaySettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

// =================================================================
// Upstream
// =================================================================

/// Upstream provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Market data REST base URL
    #[serde(default = "default_data_url")]
    pub data_url: String,
    /// Company profile / fundamentals REST base URL
    #[serde(default = "default_profile_url")]
    pub profile_url: String,
    /// Streaming endpoint
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// API key id
    #[serde(default)]
    pub api_key: String,
    /// API secret
    #[serde(default)]
    pub api_secret: String,
    /// Key for the profile/fundamentals API
    #[serde(default)]
    pub profile_api_key: String,
    /// Timeout for snapshot/profile calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for historical range calls
    #[serde(default = "default_historical_timeout")]
    pub historical_timeout_secs: u64,
    /// Cache lifetime for profile, fundamentals and history responses
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Cache lifetime for snapshots; kept below the polling interval
    #[serde(default = "default_snapshot_cache_ttl")]
    pub snapshot_cache_ttl_secs: u64,
    /// Maximum bars requested per historical call
    #[serde(default = "default_bar_limit")]
    pub bar_limit: u32,
}

fn default_data_url() -> String {
    "https://data.alpaca.markets".to_string()
}

fn default_profile_url() -> String {
    "https://financialmodelingprep.com/api/v3".to_string()
}

fn default_stream_url() -> String {
    "wss://stream.data.alpaca.markets/v2/iex".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_historical_timeout() -> u64 {
    15
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_snapshot_cache_ttl() -> u64 {
    5
}

fn default_bar_limit() -> u32 {
    10_000
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            data_url: default_data_url(),
            profile_url: default_profile_url(),
            stream_url: default_stream_url(),
            api_key: String::new(),
            api_secret: String::new(),
            profile_api_key: String::new(),
            request_timeout_secs: default_request_timeout(),
            historical_timeout_secs: default_historical_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            snapshot_cache_ttl_secs: default_snapshot_cache_ttl(),
            bar_limit: default_bar_limit(),
        }
    }
}

// =================================================================
// Collectors
// =================================================================

/// Streaming collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed delay before each reconnect attempt
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// Polling collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between cycles
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Symbols fetched concurrently per batch
    #[serde(default = "default_poll_batch_size")]
    pub batch_size: usize,
    /// Pause between batches
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// A cycle still marked active after this long is considered stuck
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
    /// Upstream requests allowed per minute
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Fetch and store fundamentals for each symbol
    #[serde(default = "default_true")]
    pub enrichment: bool,
}

fn default_poll_interval() -> u64 {
    15
}

fn default_poll_batch_size() -> usize {
    20
}

fn default_batch_pause_ms() -> u64 {
    1000
}

fn default_stuck_after() -> u64 {
    300
}

fn default_requests_per_minute() -> u32 {
    200
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_poll_interval(),
            batch_size: default_poll_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            stuck_after_secs: default_stuck_after(),
            requests_per_minute: default_requests_per_minute(),
            enrichment: true,
        }
    }
}

/// Retention cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Streaming rows older than this are deleted
    #[serde(default = "default_retention_window")]
    pub window_minutes: i64,
    /// Rows deleted per batch
    #[serde(default = "default_delete_batch_size")]
    pub batch_size: i64,
    /// Attempts per batch before the pass aborts
    #[serde(default = "default_batch_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles on each retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_retention_window() -> i64 {
    15
}

fn default_delete_batch_size() -> i64 {
    250
}

fn default_batch_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    2000
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_cleanup_interval(),
            window_minutes: default_retention_window(),
            batch_size: default_delete_batch_size(),
            max_attempts: default_batch_attempts(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

/// Symbol settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolSettings {
    /// Symbols tracked by every collector
    #[serde(default)]
    pub tracked: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("MARKET_INGEST")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = Self::config_dir();

        let s = Config::builder()
            .set_default("database.url", default_database_url())?
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // e.g. MARKET_INGEST__DATABASE__URL, MARKET_INGEST__SYMBOLS__TRACKED=AAPL,MSFT
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols.tracked")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = s.try_deserialize()?;
        settings.apply_credential_env();
        Ok(settings)
    }

    fn config_dir() -> String {
        std::env::var("MARKET_INGEST_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Provider credentials may come from the conventional variables.
    fn apply_credential_env(&mut self) {
        if self.upstream.api_key.is_empty() {
            if let Ok(key) = std::env::var("UPSTREAM_API_KEY") {
                self.upstream.api_key = key;
            }
        }
        if self.upstream.api_secret.is_empty() {
            if let Ok(secret) = std::env::var("UPSTREAM_API_SECRET") {
                self.upstream.api_secret = secret;
            }
        }
        if self.upstream.profile_api_key.is_empty() {
            if let Ok(key) = std::env::var("PROFILE_API_KEY") {
                self.upstream.profile_api_key = key;
            }
        }
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: default_database_url(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                acquire_timeout_secs: default_acquire_timeout(),
            },
            gateway: GatewaySettings::default(),
            upstream: UpstreamSettings::default(),
            streaming: StreamingSettings::default(),
            polling: PollingSettings::default(),
            backfill: BackfillConfig::default(),
            retention: RetentionSettings::default(),
            symbols: SymbolSettings::default(),
        }
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigurationError::MissingField("database.url".to_string()));
        }
        if self.gateway.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "gateway.max_retries",
                "must be greater than 0",
            ));
        }
        if self.polling.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "polling.batch_size",
                "must be greater than 0",
            ));
        }
        if self.polling.interval_secs == 0 || self.retention.interval_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "collector intervals must be greater than 0".to_string(),
            ));
        }
        if self.retention.batch_size <= 0 {
            return Err(ConfigurationError::invalid_value(
                "retention.batch_size",
                "must be greater than 0",
            ));
        }
        self.backfill
            .validate()
            .map_err(ConfigurationError::Invalid)?;
        Ok(())
    }
}

fn default_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgresql://localhost/market_data".into())
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default_settings();
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.gateway.max_retries, 3);
        assert_eq!(settings.gateway.health_check_interval(), Duration::from_secs(30));
        assert_eq!(settings.upstream.request_timeout_secs, 10);
        assert_eq!(settings.upstream.historical_timeout_secs, 15);
        assert!(settings.upstream.snapshot_cache_ttl_secs < settings.polling.interval_secs);
        assert_eq!(settings.streaming.reconnect_delay_secs, 5);
        assert_eq!(settings.polling.batch_size, 20);
        assert_eq!(settings.retention.batch_size, 250);
        assert_eq!(settings.retention.window_minutes, 15);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut settings = Settings::default_settings();
        settings.polling.batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default_settings();
        settings.database.url = "  ".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::MissingField(_))
        ));
    }

    #[test]
    fn test_sections_default_when_missing() {
        let settings: Settings =
            serde_json::from_str(r#"{"database": {"url": "postgres://db/test"}}"#).unwrap();
        assert_eq!(settings.database.min_connections, 2);
        assert_eq!(settings.polling.stuck_after_secs, 300);
        assert!(settings.symbols.tracked.is_empty());
    }
}
