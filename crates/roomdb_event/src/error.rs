//! Error types for the event crate.

use thiserror::Error;

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors raised while parsing, validating or hashing room events.
///
/// Every variant describes a malformed input. They are all rejected before
/// anything is written to storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The room version string is not one this server understands.
    #[error("unsupported room version: {version}")]
    UnsupportedRoomVersion {
        /// The version string that was received.
        version: String,
    },

    /// The event is structurally invalid.
    #[error("invalid event {event_id}: {reason}")]
    InvalidEvent {
        /// Event ID, if one was present.
        event_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The event ID does not match the format required by the room version.
    #[error("event ID {event_id} does not match room version {room_version} (expected {expected})")]
    EventIdMismatch {
        /// The event ID that was supplied.
        event_id: String,
        /// The room version of the event.
        room_version: String,
        /// The event ID that the version format requires.
        expected: String,
    },

    /// JSON could not be encoded or decoded.
    #[error("JSON error: {message}")]
    Json {
        /// Description of the failure.
        message: String,
    },
}

impl EventError {
    /// Creates an invalid event error.
    pub fn invalid(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a JSON error.
    pub fn json(message: impl Into<String>) -> Self {
        Self::Json {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EventError {
    fn from(e: serde_json::Error) -> Self {
        Self::json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EventError::invalid("$abc:example.org", "missing sender");
        let msg = err.to_string();
        assert!(msg.contains("$abc:example.org"));
        assert!(msg.contains("missing sender"));
    }

    #[test]
    fn unsupported_version_display() {
        let err = EventError::UnsupportedRoomVersion {
            version: "42".into(),
        };
        assert_eq!(err.to_string(), "unsupported room version: 42");
    }
}
