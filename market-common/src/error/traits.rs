//! Error classification traits for retry logic and error handling.
//!
//! Errors self-describe whether retrying can help, which lets the storage
//! gateway and the cleanup loop share one retry policy.

use std::time::Duration;

use tracing::warn;

use super::common::*;

/// Upper bound for any single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient errors that may resolve on retry (network issues, timeouts)
    Transient,
    /// Permanent errors that won't resolve on retry (invalid input, not found)
    Permanent,
    /// Resource exhaustion errors (rate limits, pool exhausted)
    ResourceExhausted,
    /// Configuration or structural errors (missing config, pool not initialized)
    Configuration,
    /// Internal errors (bugs, unexpected state)
    Internal,
}

/// Trait for errors that can classify themselves for retry logic.
pub trait ErrorClassification {
    /// Returns the category of this error
    fn category(&self) -> ErrorCategory;

    /// Returns true if this error is transient and may succeed on retry
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    /// Returns true if this error is permanent and won't succeed on retry
    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    /// Suggests a delay before retrying, if applicable
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(100)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Returns the maximum number of retries suggested for this error
    fn max_retries(&self) -> u32 {
        match self.category() {
            ErrorCategory::Transient => 3,
            ErrorCategory::ResourceExhausted => 5,
            _ => 0,
        }
    }
}

impl ErrorClassification for DatabaseError {
    fn category(&self) -> ErrorCategory {
        match self {
            DatabaseError::Connection(_) => ErrorCategory::Transient,
            DatabaseError::PoolExhausted => ErrorCategory::ResourceExhausted,
            DatabaseError::Timeout(_) => ErrorCategory::Transient,
            DatabaseError::Query(_) => ErrorCategory::Permanent,
            DatabaseError::Transaction(_) => ErrorCategory::Transient,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            DatabaseError::PoolExhausted => Some(Duration::from_millis(500)),
            DatabaseError::Timeout(_) => Some(Duration::from_millis(100)),
            DatabaseError::Connection(_) => Some(Duration::from_secs(1)),
            DatabaseError::Transaction(_) => Some(Duration::from_millis(50)),
            _ => None,
        }
    }
}

impl ErrorClassification for ConfigurationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }

    fn max_retries(&self) -> u32 {
        0
    }
}

/// Runs `operation` until it succeeds, fails permanently, or `max_attempts` is reached.
///
/// The delay starts at `initial_delay` and doubles after every failed attempt
/// (2s, 4s, 8s for an initial delay of 2s), capped at 30 seconds.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    E: ErrorClassification + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    let mut delay = initial_delay;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;

                if !err.is_transient() || attempts >= max_attempts {
                    return Err(err);
                }

                warn!(
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, backing off"
                );
                tokio::time::sleep(delay).await;

                delay = std::cmp::min(delay * 2, MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_database_error_classification() {
        let err = DatabaseError::Connection("reset".to_string());
        assert!(err.is_transient());
        assert!(!err.is_permanent());
        assert!(err.suggested_retry_delay().is_some());

        let err = DatabaseError::Query("syntax error".to_string());
        assert!(!err.is_transient());
        assert!(err.is_permanent());

        assert_eq!(
            DatabaseError::PoolExhausted.category(),
            ErrorCategory::ResourceExhausted
        );
    }

    #[test]
    fn test_configuration_error_never_retried() {
        let err = ConfigurationError::MissingField("database.url".to_string());
        assert!(!err.is_transient());
        assert_eq!(err.max_retries(), 0);
        assert_eq!(err.suggested_retry_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let started = tokio::time::Instant::now();
        let result: Result<u32, DatabaseError> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(DatabaseError::Connection("reset".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
            4,
            Duration::from_secs(2),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s of backoff
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), DatabaseError> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::Query("bad column".to_string()))
                }
            },
            5,
            Duration::from_secs(2),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_at_attempt_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), DatabaseError> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::Connection("lost".to_string()))
                }
            },
            3,
            Duration::from_secs(2),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
