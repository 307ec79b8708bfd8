//! Row and identifier types shared by every engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

macro_rules! nid_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Creates a new identifier from its raw value.
            #[must_use]
            pub const fn new(nid: i64) -> Self {
                Self(nid)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, ":{}"), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(nid: i64) -> Self {
                Self(nid)
            }
        }
    };
}

nid_type!(
    /// Numeric ID of a room.
    RoomNid,
    "room"
);
nid_type!(
    /// Numeric ID of an event.
    EventNid,
    "event"
);
nid_type!(
    /// Numeric ID of an event type.
    EventTypeNid,
    "type"
);
nid_type!(
    /// Numeric ID of a state key.
    EventStateKeyNid,
    "skey"
);
nid_type!(
    /// Numeric ID of a state block.
    StateBlockNid,
    "block"
);
nid_type!(
    /// Numeric ID of a state snapshot.
    StateSnapshotNid,
    "snapshot"
);
nid_type!(
    /// Position in the output log. Totally orders output events across rooms.
    StreamPosition,
    "pos"
);

impl StateSnapshotNid {
    /// The empty state. Rooms without latest events point here.
    pub const EMPTY: Self = Self(0);

    /// Returns true for the empty state.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl EventNid {
    /// Placeholder used before any event has been sent.
    pub const NONE: Self = Self(0);
}

impl StreamPosition {
    /// The position before the first event.
    pub const ZERO: Self = Self(0);

    /// Returns the next position.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Name of the counter row that orders the output log.
pub const GLOBAL_STREAM: &str = "global";

/// Event type NIDs seeded by every engine.
pub const PREASSIGNED_EVENT_TYPES: [(&str, i64); 7] = [
    ("m.room.create", 1),
    ("m.room.power_levels", 2),
    ("m.room.join_rules", 3),
    ("m.room.third_party_invite", 4),
    ("m.room.member", 5),
    ("m.room.redaction", 6),
    ("m.room.history_visibility", 7),
];

/// State key NIDs seeded by every engine.
pub const PREASSIGNED_STATE_KEYS: [(&str, i64); 1] = [("", 1)];

/// Which string-to-NID table an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NidKind {
    /// Event types.
    EventType,
    /// State keys.
    EventStateKey,
}

impl NidKind {
    /// Returns the rows every engine seeds for this kind.
    #[must_use]
    pub fn preassigned(self) -> &'static [(&'static str, i64)] {
        match self {
            Self::EventType => &PREASSIGNED_EVENT_TYPES,
            Self::EventStateKey => &PREASSIGNED_STATE_KEYS,
        }
    }
}

/// The numeric form of an `(event type, state key)` pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StateKey {
    /// Event type NID.
    pub event_type_nid: EventTypeNid,
    /// State key NID.
    pub event_state_key_nid: EventStateKeyNid,
}

impl StateKey {
    /// Creates a new state key.
    #[must_use]
    pub const fn new(event_type_nid: EventTypeNid, event_state_key_nid: EventStateKeyNid) -> Self {
        Self {
            event_type_nid,
            event_state_key_nid,
        }
    }
}

/// One mapping of a state block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StateEntry {
    /// The state slot.
    pub key: StateKey,
    /// The event occupying it.
    pub event_nid: EventNid,
}

impl StateEntry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(key: StateKey, event_nid: EventNid) -> Self {
        Self { key, event_nid }
    }
}

/// Sorts entries by key and keeps the last entry for each key.
#[must_use]
pub fn normalize_entries(entries: &[StateEntry]) -> Vec<StateEntry> {
    let mut out: Vec<StateEntry> = Vec::with_capacity(entries.len());
    let mut sorted = entries.to_vec();
    // Stable sort keeps input order within a key, so the last one wins.
    sorted.sort_by_key(|e| e.key);
    for entry in sorted {
        match out.last_mut() {
            Some(last) if last.key == entry.key => *last = entry,
            _ => out.push(entry),
        }
    }
    out
}

/// Content address of a normalized entry list.
#[must_use]
pub fn state_block_hash(entries: &[StateEntry]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.key.event_type_nid.0.to_be_bytes());
        hasher.update(entry.key.event_state_key_nid.0.to_be_bytes());
        hasher.update(entry.event_nid.0.to_be_bytes());
    }
    hasher.finalize().into()
}

/// The blocks of one snapshot, in override order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlockNidList {
    /// Snapshot NID.
    pub state_snapshot_nid: StateSnapshotNid,
    /// Block NIDs, earliest first.
    pub state_block_nids: Vec<StateBlockNid>,
}

/// The entries of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntryList {
    /// Block NID.
    pub state_block_nid: StateBlockNid,
    /// Entries, sorted by key.
    pub entries: Vec<StateEntry>,
}

/// Mutable pointers of a room row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LatestEvents {
    /// Forward extremities, sorted by NID.
    pub latest_event_nids: Vec<EventNid>,
    /// Last event forwarded to the output log.
    pub last_event_sent_nid: EventNid,
    /// State after the latest events.
    pub state_snapshot_nid: StateSnapshotNid,
}

/// A room row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    /// Room NID.
    pub room_nid: RoomNid,
    /// Room ID.
    pub room_id: String,
    /// Room version, fixed at creation.
    pub room_version: String,
    /// Mutable pointers.
    pub latest: LatestEvents,
}

/// An event to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Room the event belongs to.
    pub room_nid: RoomNid,
    /// Event ID.
    pub event_id: String,
    /// Event type NID.
    pub event_type_nid: EventTypeNid,
    /// State key NID, for state events.
    pub event_state_key_nid: Option<EventStateKeyNid>,
    /// Depth in the DAG.
    pub depth: i64,
    /// NIDs of the locally known previous events.
    pub prev_event_nids: Vec<EventNid>,
    /// State before the event.
    pub state_snapshot_nid: StateSnapshotNid,
    /// The headered event JSON.
    pub event_json: String,
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    /// Event NID.
    pub event_nid: EventNid,
    /// Room the event belongs to.
    pub room_nid: RoomNid,
    /// Event ID.
    pub event_id: String,
    /// Event type NID.
    pub event_type_nid: EventTypeNid,
    /// State key NID, for state events.
    pub event_state_key_nid: Option<EventStateKeyNid>,
    /// Depth in the DAG.
    pub depth: i64,
    /// NIDs of the locally known previous events.
    pub prev_event_nids: Vec<EventNid>,
    /// State before the event.
    pub state_snapshot_nid: StateSnapshotNid,
    /// The headered event JSON.
    pub event_json: String,
}

impl EventRow {
    /// Builds the stored row for a new event.
    #[must_use]
    pub fn from_new(event_nid: EventNid, event: &NewEvent) -> Self {
        Self {
            event_nid,
            room_nid: event.room_nid,
            event_id: event.event_id.clone(),
            event_type_nid: event.event_type_nid,
            event_state_key_nid: event.event_state_key_nid,
            depth: event.depth,
            prev_event_nids: event.prev_event_nids.clone(),
            state_snapshot_nid: event.state_snapshot_nid,
            event_json: event.event_json.clone(),
        }
    }

    /// Returns the state slot of a state event.
    #[must_use]
    pub fn state_key(&self) -> Option<StateKey> {
        self.event_state_key_nid
            .map(|skey| StateKey::new(self.event_type_nid, skey))
    }
}

/// One row of the output log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEventRow {
    /// Stream position.
    pub position: StreamPosition,
    /// Room ID.
    pub room_id: String,
    /// Event ID.
    pub event_id: String,
    /// The headered event JSON.
    pub event_json: String,
    /// Event type.
    pub event_type: String,
    /// Sender.
    pub sender: String,
    /// Whether the content carries a `url` key.
    pub contains_url: bool,
    /// State event IDs added by this event.
    pub add_state_ids: Option<Vec<String>>,
    /// State event IDs removed by this event.
    pub remove_state_ids: Option<Vec<String>>,
    /// Session of the sending device, for echo suppression.
    pub session_id: Option<i64>,
    /// Client transaction ID, for echo suppression.
    pub transaction_id: Option<String>,
    /// Hidden from sync (backfilled history).
    pub exclude_from_sync: bool,
}

impl OutputEventRow {
    /// Returns true if the row changes room state.
    #[must_use]
    pub fn carries_state(&self) -> bool {
        self.add_state_ids.is_some() || self.remove_state_ids.is_some()
    }
}

/// Scan direction of an output log query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// A bounded scan of one room's output rows in `low < position <= high`.
#[derive(Debug, Clone, Copy)]
pub struct OutputEventsQuery<'a> {
    /// Room ID.
    pub room_id: &'a str,
    /// Exclusive lower bound.
    pub low: StreamPosition,
    /// Inclusive upper bound.
    pub high: StreamPosition,
    /// Maximum number of rows.
    pub limit: usize,
    /// Scan direction. Decides which end of the window is kept.
    pub order: ScanOrder,
    /// Skip rows excluded from sync.
    pub only_sync_visible: bool,
}

impl OutputEventsQuery<'_> {
    /// Returns true if `position` lies in the window.
    #[must_use]
    pub fn contains(&self, position: StreamPosition) -> bool {
        self.low < position && position <= self.high
    }
}
