//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse classification shared by every roomdb error type.
///
/// Callers use it to decide between "report as missing", "reject the
/// request", "retry the whole transaction" and "fail".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A referenced row is missing. Signals an internal inconsistency.
    NotFound,
    /// Lock contention or a serialization failure. Retry the transaction.
    ConflictRetryable,
    /// The input was rejected before anything was written.
    Validation,
    /// The engine failed.
    Storage,
    /// The caller cancelled the operation or its deadline passed.
    Cancelled,
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A referenced row does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing row.
        what: String,
    },

    /// The transaction lost a race and should be retried from the start.
    #[error("conflict, retry transaction: {reason}")]
    ConflictRetryable {
        /// Why the transaction could not proceed.
        reason: String,
    },

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline of the operation's context passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The data source name names an engine this build does not provide.
    #[error("unsupported storage engine: {dsn}")]
    UnsupportedEngine {
        /// The data source name that was given.
        dsn: String,
    },

    /// The database engine reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// A stored column could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// What was wrong with the value.
        detail: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a retryable conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::ConflictRetryable {
            reason: reason.into(),
        }
    }

    /// Creates a corrupt row error.
    pub fn corrupt(table: &'static str, column: &'static str, detail: impl Into<String>) -> Self {
        Self::CorruptRow {
            table,
            column,
            detail: detail.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConflictRetryable { .. } => ErrorKind::ConflictRetryable,
            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,
            Self::UnsupportedEngine { .. } => ErrorKind::Validation,
            Self::Database(_) | Self::CorruptRow { .. } | Self::Io(_) => ErrorKind::Storage,
        }
    }

    /// Returns true if retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConflictRetryable
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::conflict(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::not_found(e.to_string()),
            _ => Self::Database(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert_eq!(StorageError::not_found("room 3").kind(), ErrorKind::NotFound);
        assert_eq!(StorageError::conflict("busy").kind(), ErrorKind::ConflictRetryable);
        assert_eq!(StorageError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(StorageError::DeadlineExceeded.kind(), ErrorKind::Cancelled);
        assert_eq!(StorageError::Database("x".into()).kind(), ErrorKind::Storage);
        assert!(StorageError::conflict("busy").is_retryable());
        assert!(!StorageError::not_found("x").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = StorageError::corrupt("roomserver_rooms", "latest_event_nids", "bad json");
        let msg = err.to_string();
        assert!(msg.contains("roomserver_rooms.latest_event_nids"));
        assert!(msg.contains("bad json"));
    }
}
