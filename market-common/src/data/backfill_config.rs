//! Backfill configuration
//!
//! Loaded as the `[backfill]` section of the service settings.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::gap_detection::GapDetectionConfig;

/// Backfill orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Run the scheduled backfill loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minutes between scheduled runs
    #[serde(default = "default_schedule_interval_minutes")]
    pub schedule_interval_minutes: u64,

    /// Window scanned when a run does not name one
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Interior spacing above which a gap is reported
    #[serde(default = "default_gap_threshold_minutes")]
    pub gap_threshold_minutes: i64,

    /// Uncovered span at a window edge above which a gap is reported
    #[serde(default = "default_edge_threshold_minutes")]
    pub edge_threshold_minutes: i64,

    /// Pause between consecutive gap repairs
    #[serde(default = "default_inter_gap_delay_ms")]
    pub inter_gap_delay_ms: u64,

    /// Terminal jobs kept for status queries before the oldest are evicted
    #[serde(default = "default_max_job_history")]
    pub max_job_history: usize,
}

fn default_true() -> bool {
    true
}

fn default_schedule_interval_minutes() -> u64 {
    60
}

fn default_lookback_days() -> i64 {
    7
}

fn default_gap_threshold_minutes() -> i64 {
    15
}

fn default_edge_threshold_minutes() -> i64 {
    5
}

fn default_inter_gap_delay_ms() -> u64 {
    1000
}

fn default_max_job_history() -> usize {
    100
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_interval_minutes: default_schedule_interval_minutes(),
            lookback_days: default_lookback_days(),
            gap_threshold_minutes: default_gap_threshold_minutes(),
            edge_threshold_minutes: default_edge_threshold_minutes(),
            inter_gap_delay_ms: default_inter_gap_delay_ms(),
            max_job_history: default_max_job_history(),
        }
    }
}

impl BackfillConfig {
    pub fn lookback(&self) -> Duration {
        Duration::days(self.lookback_days)
    }

    pub fn schedule_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.schedule_interval_minutes * 60)
    }

    pub fn inter_gap_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inter_gap_delay_ms)
    }

    pub fn gap_detection(&self) -> GapDetectionConfig {
        GapDetectionConfig {
            threshold_minutes: self.gap_threshold_minutes,
            edge_threshold_minutes: self.edge_threshold_minutes,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.schedule_interval_minutes == 0 {
            return Err("backfill.schedule_interval_minutes must be greater than 0".to_string());
        }
        if self.lookback_days <= 0 {
            return Err("backfill.lookback_days must be greater than 0".to_string());
        }
        if self.gap_threshold_minutes <= 0 {
            return Err("backfill.gap_threshold_minutes must be greater than 0".to_string());
        }
        if self.edge_threshold_minutes < 0 {
            return Err("backfill.edge_threshold_minutes cannot be negative".to_string());
        }
        if self.max_job_history == 0 {
            return Err("backfill.max_job_history must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackfillConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schedule_interval(), std::time::Duration::from_secs(3600));
        assert_eq!(config.lookback(), Duration::days(7));
        assert_eq!(config.gap_detection().threshold_minutes, 15);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: BackfillConfig =
            serde_json::from_str(r#"{"gap_threshold_minutes": 30}"#).unwrap();
        assert_eq!(config.gap_threshold_minutes, 30);
        assert_eq!(config.inter_gap_delay_ms, 1000);
        assert!(config.enabled);
    }

    #[test]
    fn test_validation() {
        let config = BackfillConfig {
            schedule_interval_minutes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BackfillConfig {
            gap_threshold_minutes: -1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
