//! Error types for the room server.

use roomdb_event::EventError;
use roomdb_storage::{ErrorKind, StorageError};
use thiserror::Error;

/// Result type for room server operations.
pub type RoomServerResult<T> = Result<T, RoomServerError>;

/// Errors that can occur while processing or querying room events.
#[derive(Debug, Error)]
pub enum RoomServerError {
    /// Storage layer error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The event failed validation.
    #[error(transparent)]
    Event(#[from] EventError),

    /// A non-create event arrived for a room that was never created here.
    #[error("unknown room: {room_id}")]
    UnknownRoom {
        /// The room ID.
        room_id: String,
    },

    /// The event's room version differs from the version the room was
    /// created with.
    #[error("room {room_id} has version {stored}, event claims {claimed}")]
    RoomVersionMismatch {
        /// The room ID.
        room_id: String,
        /// Version stored with the room.
        stored: String,
        /// Version carried by the event.
        claimed: String,
    },

    /// The event is well-formed but cannot be applied to the room.
    #[error("invalid event {event_id}: {reason}")]
    InvalidEvent {
        /// The event ID.
        event_id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A stored event could not be decoded.
    #[error("corrupt stored event {event_id}: {detail}")]
    CorruptEvent {
        /// The event ID.
        event_id: String,
        /// Decoder message.
        detail: String,
    },

    /// A row the room server relies on is missing.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

impl RoomServerError {
    /// Creates an invalid event error.
    pub fn invalid(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Event(_)
            | Self::UnknownRoom { .. }
            | Self::RoomVersionMismatch { .. }
            | Self::InvalidEvent { .. } => ErrorKind::Validation,
            Self::CorruptEvent { .. } => ErrorKind::Storage,
            Self::Inconsistent(_) => ErrorKind::NotFound,
        }
    }

    /// Returns true if retrying the whole operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConflictRetryable
    }

    /// Returns true if the input was rejected before anything was written.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}
