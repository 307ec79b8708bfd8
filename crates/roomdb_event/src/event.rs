//! Room events.

use crate::canonical::{event_id_from_hash, reference_hash};
use crate::error::{EventError, EventResult};
use crate::version::{EventIdFormat, RoomVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// `m.room.create`
pub const M_ROOM_CREATE: &str = "m.room.create";
/// `m.room.power_levels`
pub const M_ROOM_POWER_LEVELS: &str = "m.room.power_levels";
/// `m.room.join_rules`
pub const M_ROOM_JOIN_RULES: &str = "m.room.join_rules";
/// `m.room.third_party_invite`
pub const M_ROOM_THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";
/// `m.room.member`
pub const M_ROOM_MEMBER: &str = "m.room.member";
/// `m.room.redaction`
pub const M_ROOM_REDACTION: &str = "m.room.redaction";
/// `m.room.history_visibility`
pub const M_ROOM_HISTORY_VISIBILITY: &str = "m.room.history_visibility";
/// `m.room.name`
pub const M_ROOM_NAME: &str = "m.room.name";
/// `m.room.message`
pub const M_ROOM_MESSAGE: &str = "m.room.message";

/// The `join` membership value.
pub const MEMBERSHIP_JOIN: &str = "join";

/// An `(event type, state key)` pair identifying one slot of room state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKeyTuple {
    /// The event type, e.g. `m.room.member`.
    pub event_type: String,
    /// The state key, e.g. a user ID for membership.
    pub state_key: String,
}

impl StateKeyTuple {
    /// Creates a new tuple.
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

impl fmt::Display for StateKeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, self.state_key)
    }
}

/// A room event as exchanged between servers.
///
/// Events are immutable once stored. `prev_events` links each event to its
/// direct predecessors, forming the room DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID. Empty until assigned for hash-based room versions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    /// Room the event belongs to.
    pub room_id: String,
    /// User that sent the event.
    pub sender: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// State key; present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// IDs of the direct predecessors of this event.
    #[serde(default)]
    pub prev_events: Vec<String>,
    /// IDs of the events that authorise this one.
    #[serde(default)]
    pub auth_events: Vec<String>,
    /// Depth in the DAG.
    #[serde(default)]
    pub depth: i64,
    /// Origin timestamp in milliseconds.
    #[serde(default)]
    pub origin_server_ts: i64,
    /// Event content.
    #[serde(default)]
    pub content: Value,
}

impl Event {
    /// Returns true if this is a state event.
    #[must_use]
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Returns true if this is the room's create event.
    #[must_use]
    pub fn is_create(&self) -> bool {
        self.event_type == M_ROOM_CREATE && self.state_key.as_deref() == Some("")
    }

    /// Returns the state slot this event occupies, if it is a state event.
    #[must_use]
    pub fn state_key_tuple(&self) -> Option<StateKeyTuple> {
        self.state_key
            .as_ref()
            .map(|key| StateKeyTuple::new(self.event_type.clone(), key.clone()))
    }

    /// Returns true if this is a state event for the given slot.
    #[must_use]
    pub fn is_state_for(&self, event_type: &str, state_key: &str) -> bool {
        self.event_type == event_type && self.state_key.as_deref() == Some(state_key)
    }

    /// Returns the membership value of an `m.room.member` event.
    #[must_use]
    pub fn membership(&self) -> Option<&str> {
        if self.event_type != M_ROOM_MEMBER {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str)
    }

    /// Returns true if the content carries a `url` key.
    #[must_use]
    pub fn contains_url(&self) -> bool {
        self.content
            .as_object()
            .map_or(false, |content| content.contains_key("url"))
    }

    /// Computes the reference hash of this event.
    pub fn reference_hash(&self) -> EventResult<[u8; 32]> {
        reference_hash(self)
    }

    /// Checks the structural rules every event must satisfy.
    pub fn validate(&self) -> EventResult<()> {
        let invalid = |reason: &str| Err(EventError::invalid(self.event_id.clone(), reason));

        if !is_qualified_id(&self.room_id, '!') {
            return invalid("room_id must have the form !localpart:server");
        }
        if !is_qualified_id(&self.sender, '@') {
            return invalid("sender must have the form @localpart:server");
        }
        if self.event_type.is_empty() {
            return invalid("type must not be empty");
        }
        if self.depth < 0 {
            return invalid("depth must not be negative");
        }

        if self.event_type == M_ROOM_CREATE {
            if self.state_key.as_deref() != Some("") {
                return invalid("m.room.create must have an empty state key");
            }
            if !self.prev_events.is_empty() {
                return invalid("m.room.create must not have prev_events");
            }
        } else if self.prev_events.is_empty() {
            return invalid("prev_events must not be empty");
        }

        let mut seen = HashSet::with_capacity(self.prev_events.len());
        for prev in &self.prev_events {
            if !seen.insert(prev.as_str()) {
                return invalid("prev_events contains duplicates");
            }
            if !self.event_id.is_empty() && *prev == self.event_id {
                return invalid("event lists itself in prev_events");
            }
        }
        Ok(())
    }
}

fn is_qualified_id(id: &str, sigil: char) -> bool {
    let Some(rest) = id.strip_prefix(sigil) else {
        return false;
    };
    match rest.split_once(':') {
        Some((local, server)) => !local.is_empty() && !server.is_empty(),
        None => false,
    }
}

/// An event together with the version of the room it belongs to.
///
/// Construct through [`HeaderedEvent::new`], which validates the event and
/// assigns or verifies its event ID for the room version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderedEvent {
    /// Version of the room.
    #[serde(rename = "_room_version")]
    pub room_version: RoomVersion,
    /// The event itself.
    #[serde(flatten)]
    pub event: Event,
}

impl HeaderedEvent {
    /// Validates `event` for `room_version` and fixes its event ID.
    ///
    /// For hash-based versions an empty event ID is filled in; a supplied one
    /// must equal the computed ID.
    pub fn new(room_version: RoomVersion, mut event: Event) -> EventResult<Self> {
        match room_version.event_id_format() {
            EventIdFormat::Origin => {
                if !is_qualified_id(&event.event_id, '$') {
                    return Err(EventError::invalid(
                        event.event_id.clone(),
                        "event_id must have the form $localpart:server for this room version",
                    ));
                }
            }
            format => {
                let hash = event.reference_hash()?;
                let expected = event_id_from_hash(format, &hash).unwrap_or_default();
                if event.event_id.is_empty() {
                    event.event_id = expected;
                } else if event.event_id != expected {
                    return Err(EventError::EventIdMismatch {
                        event_id: event.event_id,
                        room_version: room_version.to_string(),
                        expected,
                    });
                }
            }
        }
        event.validate()?;
        Ok(Self {
            room_version,
            event,
        })
    }

    /// Decodes a headered event from JSON and validates it.
    pub fn from_json(json: &str) -> EventResult<Self> {
        let decoded: HeaderedEvent = serde_json::from_str(json)?;
        Self::new(decoded.room_version, decoded.event)
    }

    /// Encodes the headered event as JSON.
    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the event ID.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    /// Returns the room ID.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.event.room_id
    }
}

impl std::ops::Deref for HeaderedEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            room_id: "!room:example.org".into(),
            sender: "@alice:example.org".into(),
            event_type: M_ROOM_CREATE.into(),
            state_key: Some(String::new()),
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin_server_ts: 1000,
            content: json!({"creator": "@alice:example.org"}),
        }
    }

    #[test]
    fn origin_format_requires_qualified_id() {
        assert!(HeaderedEvent::new(RoomVersion::V1, create_event("$create:example.org")).is_ok());
        assert!(HeaderedEvent::new(RoomVersion::V1, create_event("")).is_err());
        assert!(HeaderedEvent::new(RoomVersion::V2, create_event("create")).is_err());
    }

    #[test]
    fn hash_format_assigns_event_id() {
        let ev = HeaderedEvent::new(RoomVersion::V4, create_event("")).unwrap();
        assert!(ev.event_id().starts_with('$'));
        assert!(!ev.event_id().contains(':'));

        // Supplying the same ID again is accepted
        let again = HeaderedEvent::new(RoomVersion::V4, ev.event.clone()).unwrap();
        assert_eq!(again.event_id(), ev.event_id());
    }

    #[test]
    fn hash_format_rejects_wrong_id() {
        let err = HeaderedEvent::new(RoomVersion::V5, create_event("$forged")).unwrap_err();
        assert!(matches!(err, EventError::EventIdMismatch { .. }));
    }

    #[test]
    fn create_rules() {
        let mut ev = create_event("$c:example.org");
        ev.prev_events = vec!["$x:example.org".into()];
        assert!(ev.validate().is_err());

        let mut ev = create_event("$c:example.org");
        ev.state_key = Some("nope".into());
        assert!(ev.validate().is_err());
    }

    #[test]
    fn non_create_needs_prev_events() {
        let mut ev = create_event("$m:example.org");
        ev.event_type = M_ROOM_MESSAGE.into();
        ev.state_key = None;
        assert!(ev.validate().is_err());

        ev.prev_events = vec!["$c:example.org".into(), "$c:example.org".into()];
        assert!(ev.validate().is_err());

        ev.prev_events = vec!["$c:example.org".into()];
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_ids() {
        let mut ev = create_event("$c:example.org");
        ev.sender = "alice".into();
        assert!(ev.validate().is_err());

        let mut ev = create_event("$c:example.org");
        ev.room_id = "!:example.org".into();
        assert!(ev.validate().is_err());
    }

    #[test]
    fn membership_and_url() {
        let mut ev = create_event("$m:example.org");
        ev.event_type = M_ROOM_MEMBER.into();
        ev.state_key = Some("@bob:example.org".into());
        ev.content = json!({"membership": "join", "url": "mxc://x/y"});
        assert_eq!(ev.membership(), Some(MEMBERSHIP_JOIN));
        assert!(ev.contains_url());
        assert!(ev.is_state_for(M_ROOM_MEMBER, "@bob:example.org"));
        assert_eq!(
            ev.state_key_tuple(),
            Some(StateKeyTuple::new(M_ROOM_MEMBER, "@bob:example.org"))
        );
    }

    #[test]
    fn headered_json_carries_version() {
        let ev = HeaderedEvent::new(RoomVersion::V3, create_event("")).unwrap();
        let json = ev.to_json().unwrap();
        assert!(json.contains("\"_room_version\":\"3\""));

        let back = HeaderedEvent::from_json(&json).unwrap();
        assert_eq!(back, ev);
    }
}
