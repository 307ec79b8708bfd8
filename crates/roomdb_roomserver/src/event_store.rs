//! Event persistence.

use crate::error::{RoomServerError, RoomServerResult};
use crate::nid::NidAllocator;
use roomdb_event::HeaderedEvent;
use roomdb_storage::{
    EventNid, EventRow, NewEvent, RoomNid, StateEntry, StateKey, StateSnapshotNid, Txn,
};
use std::collections::HashSet;

/// A stored event together with its room-server bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Event NID.
    pub event_nid: EventNid,
    /// Room NID.
    pub room_nid: RoomNid,
    /// State slot of a state event.
    pub state_key: Option<StateKey>,
    /// State before the event.
    pub state_before: StateSnapshotNid,
    /// NIDs of the prev events known when the event was stored.
    pub prev_event_nids: Vec<EventNid>,
    /// The event.
    pub event: HeaderedEvent,
}

impl StoredEvent {
    fn from_row(row: EventRow) -> RoomServerResult<Self> {
        let event: HeaderedEvent =
            serde_json::from_str(&row.event_json).map_err(|e| RoomServerError::CorruptEvent {
                event_id: row.event_id.clone(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            event_nid: row.event_nid,
            room_nid: row.room_nid,
            state_key: row.state_key(),
            state_before: row.state_snapshot_nid,
            prev_event_nids: row.prev_event_nids,
            event,
        })
    }

    /// The entry this event contributes to the state after it.
    #[must_use]
    pub fn state_entry(&self) -> Option<StateEntry> {
        self.state_key
            .map(|key| StateEntry::new(key, self.event_nid))
    }

    /// Returns the event ID.
    #[must_use]
    pub fn event_id(&self) -> &str {
        self.event.event_id()
    }
}

/// Which prev events of an event are stored locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrevEvents {
    /// NIDs of the known prev events, sorted.
    pub known: Vec<EventNid>,
    /// IDs of the unknown prev events, in input order.
    pub missing: Vec<String>,
}

impl PrevEvents {
    /// Returns true if every prev event is known.
    #[must_use]
    pub fn all_exist(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Event persistence over an open transaction.
pub trait EventStore: Txn {
    /// Stores an event and its prev-event links. Returns the event NID and
    /// whether this call stored it; re-inserting an event is a no-op that
    /// returns the original NID.
    fn insert_headered_event(
        &mut self,
        room_nid: RoomNid,
        event: &HeaderedEvent,
        prev_event_nids: &[EventNid],
        state_before: StateSnapshotNid,
    ) -> RoomServerResult<(EventNid, bool)> {
        let event_type_nid = self.event_type_nid(&event.event_type)?;
        let event_state_key_nid = match &event.state_key {
            Some(key) => Some(self.event_state_key_nid(key)?),
            None => None,
        };
        let (event_nid, inserted) = self.insert_event(&NewEvent {
            room_nid,
            event_id: event.event_id().to_string(),
            event_type_nid,
            event_state_key_nid,
            depth: event.depth,
            prev_event_nids: prev_event_nids.to_vec(),
            state_snapshot_nid: state_before,
            event_json: event.to_json()?,
        })?;
        if inserted {
            for prev in &event.prev_events {
                self.insert_previous_event(prev, event_nid)?;
            }
        }
        Ok((event_nid, inserted))
    }

    /// Loads events by ID, sorted by NID. Unknown IDs are omitted; callers
    /// compare cardinality when they need all of them.
    fn events_by_id(&self, event_ids: &[String]) -> RoomServerResult<Vec<StoredEvent>> {
        self.bulk_select_events_by_id(event_ids)?
            .into_iter()
            .map(StoredEvent::from_row)
            .collect()
    }

    /// Loads events by NID, sorted by NID. Unknown NIDs are omitted.
    fn events_by_nid(&self, event_nids: &[EventNid]) -> RoomServerResult<Vec<StoredEvent>> {
        self.bulk_select_events(event_nids)?
            .into_iter()
            .map(StoredEvent::from_row)
            .collect()
    }

    /// Splits prev event IDs into known NIDs and missing IDs.
    fn prev_events_exist(&self, prev_event_ids: &[String]) -> RoomServerResult<PrevEvents> {
        let found = self.bulk_select_event_nids(prev_event_ids)?;
        let mut known: Vec<EventNid> = found.values().copied().collect();
        known.sort_unstable();
        known.dedup();
        let mut seen = HashSet::new();
        let missing = prev_event_ids
            .iter()
            .filter(|id| !found.contains_key(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect();
        Ok(PrevEvents { known, missing })
    }

    /// Maps event NIDs to event IDs. Fails if any NID is unknown.
    fn event_ids_for(&self, event_nids: &[EventNid]) -> RoomServerResult<Vec<String>> {
        let rows = self.bulk_select_events(event_nids)?;
        let mut ids = Vec::with_capacity(event_nids.len());
        for nid in event_nids {
            let row = rows
                .binary_search_by_key(nid, |r| r.event_nid)
                .map_err(|_| RoomServerError::Inconsistent(format!("missing {nid}")))?;
            ids.push(rows[row].event_id.clone());
        }
        Ok(ids)
    }
}

impl<T: Txn + ?Sized> EventStore for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdb_event::{Event, RoomVersion};
    use roomdb_storage::{Context, MemoryStore, Store};
    use serde_json::json;

    fn event(id: &str, prev: &[&str], state_key: Option<&str>) -> HeaderedEvent {
        HeaderedEvent::new(
            RoomVersion::V1,
            Event {
                event_id: id.to_string(),
                room_id: "!r:x".into(),
                sender: "@alice:x".into(),
                event_type: if prev.is_empty() {
                    "m.room.create".into()
                } else {
                    "m.room.name".into()
                },
                state_key: state_key.map(str::to_string),
                prev_events: prev.iter().map(|p| p.to_string()).collect(),
                auth_events: vec![],
                depth: prev.len() as i64 + 1,
                origin_server_ts: 0,
                content: json!({}),
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_is_idempotent_and_links_prevs() {
        let store = MemoryStore::new();
        let mut txn = store.begin(&Context::background()).unwrap();
        let room = txn.room_nid("!r:x", "1").unwrap();

        let create = event("$c:x", &[], Some(""));
        let (c, inserted) = txn
            .insert_headered_event(room, &create, &[], StateSnapshotNid::EMPTY)
            .unwrap();
        assert!(inserted);
        let (again, inserted) = txn
            .insert_headered_event(room, &create, &[], StateSnapshotNid::EMPTY)
            .unwrap();
        assert!(!inserted);
        assert_eq!(again, c);

        let name = event("$n:x", &["$c:x", "$gone:x"], Some(""));
        let (n, _) = txn
            .insert_headered_event(room, &name, &[c], StateSnapshotNid::EMPTY)
            .unwrap();
        assert!(txn.select_previous_event_exists("$c:x").unwrap());
        assert!(txn.select_previous_event_exists("$gone:x").unwrap());

        let loaded = txn.events_by_nid(&[n, c]).unwrap();
        assert_eq!(loaded[0].event, create);
        assert_eq!(loaded[1].prev_event_nids, vec![c]);
        assert!(loaded[1].state_entry().is_some());
        assert_eq!(txn.event_ids_for(&[n, c]).unwrap(), vec!["$n:x", "$c:x"]);
    }

    #[test]
    fn prev_events_report_missing() {
        let store = MemoryStore::new();
        let mut txn = store.begin(&Context::background()).unwrap();
        let room = txn.room_nid("!r:x", "1").unwrap();
        let create = event("$c:x", &[], Some(""));
        let (c, _) = txn
            .insert_headered_event(room, &create, &[], StateSnapshotNid::EMPTY)
            .unwrap();

        let prevs = txn
            .prev_events_exist(&["$c:x".into(), "$a:x".into(), "$a:x".into()])
            .unwrap();
        assert_eq!(prevs.known, vec![c]);
        assert_eq!(prevs.missing, vec!["$a:x".to_string()]);
        assert!(!prevs.all_exist());
    }
}
