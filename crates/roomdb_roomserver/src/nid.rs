//! String to NID assignment.
//!
//! Every lookup here is insert-if-absent: concurrent callers asking for the
//! same string converge on the same NID, and a NID is never reassigned.

use crate::error::RoomServerResult;
use roomdb_event::StateKeyTuple;
use roomdb_storage::{
    EventStateKeyNid, EventTypeNid, NidKind, RoomNid, StateKey, Txn,
};
use std::collections::HashMap;

/// NID assignment over an open transaction.
///
/// Implemented for every [`Txn`], so the methods are available directly on
/// a transaction.
pub trait NidAllocator: Txn {
    /// Returns the NID of a room, creating the room row if needed.
    fn room_nid(&mut self, room_id: &str, room_version: &str) -> RoomServerResult<RoomNid> {
        Ok(self.insert_room_nid(room_id, room_version)?)
    }

    /// Returns the NID of an event type, assigning one if needed.
    fn event_type_nid(&mut self, event_type: &str) -> RoomServerResult<EventTypeNid> {
        Ok(EventTypeNid(self.insert_nid(NidKind::EventType, event_type)?))
    }

    /// Returns the NID of a state key, assigning one if needed.
    fn event_state_key_nid(&mut self, state_key: &str) -> RoomServerResult<EventStateKeyNid> {
        Ok(EventStateKeyNid(
            self.insert_nid(NidKind::EventStateKey, state_key)?,
        ))
    }

    /// Returns the numeric form of a state slot, assigning NIDs if needed.
    fn state_key_nids(&mut self, tuple: &StateKeyTuple) -> RoomServerResult<StateKey> {
        Ok(StateKey::new(
            self.event_type_nid(&tuple.event_type)?,
            self.event_state_key_nid(&tuple.state_key)?,
        ))
    }

    /// Looks up the numeric form of state slots without assigning NIDs.
    /// Slots with an unknown type or key are omitted: no event can occupy
    /// them.
    fn lookup_state_keys(
        &self,
        tuples: &[StateKeyTuple],
    ) -> RoomServerResult<HashMap<StateKey, StateKeyTuple>> {
        let types: Vec<String> = tuples.iter().map(|t| t.event_type.clone()).collect();
        let keys: Vec<String> = tuples.iter().map(|t| t.state_key.clone()).collect();
        let type_nids = self.bulk_select_nids(NidKind::EventType, &types)?;
        let key_nids = self.bulk_select_nids(NidKind::EventStateKey, &keys)?;

        let mut out = HashMap::with_capacity(tuples.len());
        for tuple in tuples {
            if let (Some(t), Some(k)) = (
                type_nids.get(&tuple.event_type),
                key_nids.get(&tuple.state_key),
            ) {
                out.insert(
                    StateKey::new(EventTypeNid(*t), EventStateKeyNid(*k)),
                    tuple.clone(),
                );
            }
        }
        Ok(out)
    }
}

impl<T: Txn + ?Sized> NidAllocator for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdb_storage::{Context, MemoryStore, Store};

    #[test]
    fn preassigned_and_fresh_nids() {
        let store = MemoryStore::new();
        let mut txn = store.begin(&Context::background()).unwrap();

        let member = txn
            .state_key_nids(&StateKeyTuple::new("m.room.member", ""))
            .unwrap();
        assert_eq!(member, StateKey::new(EventTypeNid(5), EventStateKeyNid(1)));

        let topic = txn.event_type_nid("m.room.topic").unwrap();
        assert_eq!(txn.event_type_nid("m.room.topic").unwrap(), topic);
        assert!(topic.as_i64() > 7);
    }

    #[test]
    fn lookup_skips_unknown_slots() {
        let store = MemoryStore::new();
        let mut txn = store.begin(&Context::background()).unwrap();
        let alice = txn
            .state_key_nids(&StateKeyTuple::new("m.room.member", "@alice:x"))
            .unwrap();

        let found = txn
            .lookup_state_keys(&[
                StateKeyTuple::new("m.room.member", "@alice:x"),
                StateKeyTuple::new("m.room.member", "@nobody:x"),
                StateKeyTuple::new("m.custom", ""),
            ])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&alice].state_key, "@alice:x");
    }
}
