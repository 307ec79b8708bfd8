//! Input and output types of the room server.

use roomdb_event::HeaderedEvent;
use roomdb_storage::{EventNid, StateKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolved room state: one event per state slot.
pub type StateMap = BTreeMap<StateKey, EventNid>;

/// How an input event relates to the room's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// A new event that may advance the room.
    #[default]
    New,
    /// Historical context. Stored, but never moves the room's latest events.
    Backfill,
}

/// Client transaction ID of the device that sent an event, used to
/// suppress echoes to that device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// Session of the sending device.
    pub session_id: i64,
    /// Transaction ID chosen by the client.
    pub transaction_id: String,
}

/// An event to feed into the room server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRoomEvent {
    /// Input kind.
    #[serde(default)]
    pub kind: InputKind,
    /// The event and its room version.
    pub event: HeaderedEvent,
    /// State before the event, as event IDs. Lets an event be applied when
    /// its prev events are not known locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_event_ids: Option<Vec<String>>,
    /// Sending device's transaction ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
}

impl InputRoomEvent {
    /// A new event.
    #[must_use]
    pub fn new(event: HeaderedEvent) -> Self {
        Self {
            kind: InputKind::New,
            event,
            state_event_ids: None,
            transaction_id: None,
        }
    }

    /// A backfilled event.
    #[must_use]
    pub fn backfill(event: HeaderedEvent) -> Self {
        Self {
            kind: InputKind::Backfill,
            ..Self::new(event)
        }
    }

    /// Supplies the state before the event.
    #[must_use]
    pub fn with_state(mut self, state_event_ids: Vec<String>) -> Self {
        self.state_event_ids = Some(state_event_ids);
        self
    }

    /// Attaches the sending device's transaction ID.
    #[must_use]
    pub fn with_transaction_id(mut self, session_id: i64, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(TransactionId {
            session_id,
            transaction_id: transaction_id.into(),
        });
        self
    }
}

/// What the sync API needs to know about an applied event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNewRoomEvent {
    /// The event.
    pub event: HeaderedEvent,
    /// Forward extremities after the event, sorted by NID.
    pub latest_event_ids: Vec<String>,
    /// The event forwarded to the output log before this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_event_id: Option<String>,
    /// State event IDs that entered the room state.
    #[serde(default)]
    pub adds_state_event_ids: Vec<String>,
    /// State event IDs that left the room state.
    #[serde(default)]
    pub removes_state_event_ids: Vec<String>,
    /// Sending device's transaction ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    /// Hide from sync timelines.
    #[serde(default)]
    pub exclude_from_sync: bool,
}

impl OutputNewRoomEvent {
    /// Returns true if the event changed the room state.
    #[must_use]
    pub fn changes_state(&self) -> bool {
        !self.adds_state_event_ids.is_empty() || !self.removes_state_event_ids.is_empty()
    }
}

/// Result of processing one input event.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomUpdate {
    /// The event was stored.
    Applied(OutputNewRoomEvent),
    /// The event was already stored. Nothing changed.
    AlreadyExists {
        /// NID of the stored event.
        event_nid: EventNid,
    },
    /// Some prev events are unknown and no state was supplied. Nothing was
    /// written; backfill the missing events and retry.
    MissingPrevEvents {
        /// The unknown event IDs.
        missing: Vec<String>,
    },
}

impl RoomUpdate {
    /// Returns the output of an applied event.
    #[must_use]
    pub fn applied(&self) -> Option<&OutputNewRoomEvent> {
        match self {
            Self::Applied(output) => Some(output),
            _ => None,
        }
    }
}
