use std::time::Duration;

use market_common::error::{DatabaseError, ErrorCategory, ErrorClassification};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// No pool has been created yet, or it was closed for shutdown
    #[error("Storage pool not initialized")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(DatabaseError::from(err))
    }
}

impl StorageError {
    /// Connection-level failure that warrants re-establishing the pool.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StorageError::Database(db) if db.is_connection_loss())
    }
}

impl ErrorClassification for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Database(db) => db.category(),
            StorageError::NotInitialized => ErrorCategory::Configuration,
            StorageError::NotFound(_) => ErrorCategory::Permanent,
            StorageError::InvalidData(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            StorageError::Database(db) => db.suggested_retry_delay(),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_follows_database_error() {
        let err = StorageError::from(sqlx::Error::PoolClosed);
        assert!(err.is_transient());
        assert!(err.is_connection_loss());

        let err = StorageError::from(sqlx::Error::RowNotFound);
        assert!(err.is_permanent());
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn test_not_initialized_is_structural() {
        let err = StorageError::NotInitialized;
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_transient());
    }
}
