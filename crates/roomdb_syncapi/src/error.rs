//! Error types for the sync API.

use roomdb_event::EventError;
use roomdb_storage::{ErrorKind, StorageError};
use thiserror::Error;

/// Result type for sync API operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync API.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage layer error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An event failed to encode.
    #[error(transparent)]
    Event(#[from] EventError),

    /// A stored output row could not be decoded.
    #[error("corrupt output row for {event_id}: {detail}")]
    CorruptRow {
        /// Event ID of the row.
        event_id: String,
        /// Decoder message.
        detail: String,
    },

    /// A sync token could not be parsed.
    #[error("invalid sync token: {0}")]
    InvalidToken(String),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The consumer stopped on an output it could not append.
    #[error("consumer stopped after feed sequence {cursor}: {source}")]
    ConsumerStopped {
        /// Sequence of the last output appended. Catch up from here.
        cursor: u64,
        /// Why the next append failed.
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Storage(e) => e.kind(),
            SyncError::Event(_) | SyncError::InvalidToken(_) | SyncError::InvalidRequest(_) => {
                ErrorKind::Validation
            }
            SyncError::CorruptRow { .. } => ErrorKind::Storage,
            SyncError::ConsumerStopped { source, .. } => source.kind(),
        }
    }

    /// Returns true if retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConflictRetryable
    }

    /// Returns true if the caller sent something unusable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidToken(_) | SyncError::InvalidRequest(_)
        )
    }
}
