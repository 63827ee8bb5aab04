//! Common error types shared across crates.
//!
//! Crate-specific errors wrap these using `#[from]`.

use std::time::Duration;
use thiserror::Error;

/// Message fragments that identify a dropped or poisoned connection.
const CONNECTION_LOSS_MARKERS: &[&str] = &[
    "connection reset",
    "connection lost",
    "connection refused",
    "connection closed",
    "terminating connection",
    "broken pipe",
    "enqueue after fatal error",
    "server closed the connection",
];

/// Database-related errors.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Query execution failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Connection to the database failed or was lost mid-operation
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Transaction failed (begin, commit, rollback)
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Connection pool exhausted
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Query timeout
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),
}

impl DatabaseError {
    /// True when the error means the underlying connection is gone and the
    /// pool should be re-established before retrying.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, DatabaseError::Connection(_))
    }
}

/// Returns true if a driver or server message describes a lost connection.
pub fn is_connection_loss_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CONNECTION_LOSS_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted,
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Tls(_) => DatabaseError::Connection(err.to_string()),
            sqlx::Error::Protocol(msg) if is_connection_loss_message(msg) => {
                DatabaseError::Connection(err.to_string())
            }
            sqlx::Error::Database(db) if is_connection_loss_message(db.message()) => {
                DatabaseError::Connection(err.to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Configuration-related errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Field has invalid value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration source could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration combination
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigurationError {
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
