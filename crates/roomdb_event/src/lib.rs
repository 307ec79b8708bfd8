//! # roomdb Event
//!
//! Room event model and canonical JSON hashing for roomdb.
//!
//! This crate provides:
//! - [`Event`] and [`HeaderedEvent`], the unit of room history
//! - [`RoomVersion`], which selects the event ID format and the state
//!   resolution ordering of a room
//! - Canonical JSON encoding and reference hashes
//!
//! ## Usage
//!
//! ```
//! use roomdb_event::{Event, HeaderedEvent, RoomVersion};
//! use serde_json::json;
//!
//! let create = Event {
//!     event_id: String::new(),
//!     room_id: "!room:example.org".into(),
//!     sender: "@alice:example.org".into(),
//!     event_type: "m.room.create".into(),
//!     state_key: Some(String::new()),
//!     prev_events: vec![],
//!     auth_events: vec![],
//!     depth: 1,
//!     origin_server_ts: 0,
//!     content: json!({"creator": "@alice:example.org"}),
//! };
//!
//! // Hash-based versions derive the event ID from the content.
//! let headered = HeaderedEvent::new(RoomVersion::V6, create).unwrap();
//! assert!(headered.event_id().starts_with('$'));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod error;
mod event;
mod version;

pub use canonical::{event_id_from_hash, reference_hash, to_canonical_json};
pub use error::{EventError, EventResult};
pub use event::{
    Event, HeaderedEvent, StateKeyTuple, MEMBERSHIP_JOIN, M_ROOM_CREATE,
    M_ROOM_HISTORY_VISIBILITY, M_ROOM_JOIN_RULES, M_ROOM_MEMBER, M_ROOM_MESSAGE, M_ROOM_NAME,
    M_ROOM_POWER_LEVELS, M_ROOM_REDACTION, M_ROOM_THIRD_PARTY_INVITE,
};
pub use version::{EventIdFormat, RoomVersion, StateResAlgorithm};
