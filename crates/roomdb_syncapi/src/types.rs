//! Positions, ranges and stream events.

use crate::error::{SyncError, SyncResult};
use roomdb_event::HeaderedEvent;
use roomdb_roomserver::TransactionId;
pub use roomdb_storage::StreamPosition;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// A window over the output log.
///
/// Forward ranges cover `from < position <= to`; backward ranges cover
/// `to < position <= from`.
///
/// ```
/// use roomdb_syncapi::{Range, StreamPosition};
///
/// let back = Range::backward(StreamPosition(9), StreamPosition(4));
/// assert_eq!(back.low(), StreamPosition(4));
/// assert_eq!(back.high(), StreamPosition(9));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Where iteration starts.
    pub from: StreamPosition,
    /// Where iteration ends.
    pub to: StreamPosition,
    /// Iterate from newest to oldest.
    pub backwards: bool,
}

impl Range {
    /// Oldest to newest over `from < position <= to`.
    pub const fn forward(from: StreamPosition, to: StreamPosition) -> Self {
        Self {
            from,
            to,
            backwards: false,
        }
    }

    /// Newest to oldest over `to < position <= from`.
    pub const fn backward(from: StreamPosition, to: StreamPosition) -> Self {
        Self {
            from,
            to,
            backwards: true,
        }
    }

    /// Exclusive lower bound.
    pub fn low(&self) -> StreamPosition {
        if self.backwards {
            self.to
        } else {
            self.from
        }
    }

    /// Inclusive upper bound.
    pub fn high(&self) -> StreamPosition {
        if self.backwards {
            self.from
        } else {
            self.to
        }
    }

    /// Returns true if `position` lies in the window.
    pub fn contains(&self, position: StreamPosition) -> bool {
        self.low() < position && position <= self.high()
    }

    /// Returns true if the window holds no positions.
    pub fn is_empty(&self) -> bool {
        self.low() >= self.high()
    }
}

/// An opaque sync position handed to clients, `s<position>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SyncToken(pub StreamPosition);

impl SyncToken {
    /// Returns the stream position.
    pub fn position(self) -> StreamPosition {
        self.0
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0.as_i64())
    }
}

impl FromStr for SyncToken {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        s.strip_prefix('s')
            .and_then(|n| n.parse::<i64>().ok())
            .filter(|n| *n >= 0)
            .map(|n| SyncToken(StreamPosition(n)))
            .ok_or_else(|| SyncError::InvalidToken(s.to_string()))
    }
}

impl Serialize for SyncToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SyncToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An output log row with its event decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    /// Stream position.
    pub position: StreamPosition,
    /// The event.
    pub event: HeaderedEvent,
    /// Sending device's transaction ID, if both parts were recorded.
    pub transaction_id: Option<TransactionId>,
    /// Hidden from sync timelines.
    pub exclude_from_sync: bool,
}

/// State changes across a range, folded per room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateInRange {
    /// Per room, the state event IDs that entered the state in the range and
    /// are still in it at the end.
    pub needed: BTreeMap<String, BTreeSet<String>>,
    /// The state-carrying rows seen, by event ID.
    pub events: HashMap<String, StreamEvent>,
}

impl StateInRange {
    /// Needed state of one room, with the event where the range holds it.
    pub fn room_state(&self, room_id: &str) -> Vec<&StreamEvent> {
        let mut out: Vec<&StreamEvent> = self
            .needed
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.events.get(id))
            .collect();
        out.sort_by_key(|e| e.position);
        out
    }
}
