//! State snapshots over content-addressed blocks.
//!
//! A snapshot is an ordered list of blocks. Expanding one folds the blocks
//! left to right, so a later block overrides an earlier one for the same
//! state slot. Linear history adds at most one small block per state event;
//! once a snapshot would stack more than the configured number of blocks, a
//! single block holding the full state is written instead.

use crate::error::{RoomServerError, RoomServerResult};
use crate::event_store::StoredEvent;
use crate::types::StateMap;
use roomdb_storage::{
    RoomNid, StateBlockNid, StateEntry, StateEntryList, StateSnapshotNid, Txn,
};
use std::collections::BTreeMap;
use tracing::trace;

/// Difference between two states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    /// Entries of the old state that the new state no longer has.
    pub removed: Vec<StateEntry>,
    /// Entries of the new state that the old state did not have.
    pub added: Vec<StateEntry>,
}

impl StateDelta {
    /// Returns true if the states are equal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compares two states entry by entry. A slot whose event changed shows up
/// in both lists.
#[must_use]
pub fn state_diff(old: &StateMap, new: &StateMap) -> StateDelta {
    let removed = old
        .iter()
        .filter(|(key, nid)| new.get(key) != Some(nid))
        .map(|(key, nid)| StateEntry::new(*key, *nid))
        .collect();
    let added = new
        .iter()
        .filter(|(key, nid)| old.get(key) != Some(nid))
        .map(|(key, nid)| StateEntry::new(*key, *nid))
        .collect();
    StateDelta { removed, added }
}

fn to_entries(state: &StateMap) -> Vec<StateEntry> {
    state
        .iter()
        .map(|(key, nid)| StateEntry::new(*key, *nid))
        .collect()
}

fn fold_blocks(blocks: &[StateBlockNid], loaded: &[StateEntryList]) -> RoomServerResult<StateMap> {
    let mut state = StateMap::new();
    for block in blocks {
        let idx = loaded
            .binary_search_by_key(block, |list| list.state_block_nid)
            .map_err(|_| RoomServerError::Inconsistent(format!("missing {block}")))?;
        for entry in &loaded[idx].entries {
            state.insert(entry.key, entry.event_nid);
        }
    }
    Ok(state)
}

/// Snapshot and block access over an open transaction.
pub trait StateStore: Txn {
    /// Returns the block list of a snapshot. The empty snapshot has none.
    fn snapshot_blocks(&self, snapshot: StateSnapshotNid) -> RoomServerResult<Vec<StateBlockNid>> {
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        let mut lists = self.bulk_select_state_block_nids(&[snapshot])?;
        match lists.pop() {
            Some(list) => Ok(list.state_block_nids),
            None => Err(RoomServerError::Inconsistent(format!("missing {snapshot}"))),
        }
    }

    /// Expands one snapshot into the full state.
    fn load_snapshot(&self, snapshot: StateSnapshotNid) -> RoomServerResult<StateMap> {
        let mut states = self.load_snapshots(&[snapshot])?;
        Ok(states.remove(&snapshot).unwrap_or_default())
    }

    /// Expands many snapshots with one round trip per table.
    fn load_snapshots(
        &self,
        snapshots: &[StateSnapshotNid],
    ) -> RoomServerResult<BTreeMap<StateSnapshotNid, StateMap>> {
        let mut wanted: Vec<StateSnapshotNid> = snapshots
            .iter()
            .copied()
            .filter(|s| !s.is_empty())
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut out = BTreeMap::new();
        if snapshots.iter().any(|s| s.is_empty()) {
            out.insert(StateSnapshotNid::EMPTY, StateMap::new());
        }
        if wanted.is_empty() {
            return Ok(out);
        }

        let lists = self.bulk_select_state_block_nids(&wanted)?;
        let mut blocks: Vec<StateBlockNid> = lists
            .iter()
            .flat_map(|list| list.state_block_nids.iter().copied())
            .collect();
        blocks.sort_unstable();
        blocks.dedup();
        let loaded = self.bulk_select_state_block_entries(&blocks)?;

        for list in &lists {
            out.insert(
                list.state_snapshot_nid,
                fold_blocks(&list.state_block_nids, &loaded)?,
            );
        }
        trace!(snapshots = out.len(), blocks = blocks.len(), "loaded state");
        Ok(out)
    }

    /// Returns the state after a stored event: the state before it plus its
    /// own entry if it is a state event.
    fn state_after_event(&self, event: &StoredEvent) -> RoomServerResult<StateMap> {
        let mut state = self.load_snapshot(event.state_before)?;
        if let Some(entry) = event.state_entry() {
            state.insert(entry.key, entry.event_nid);
        }
        Ok(state)
    }

    /// Layers `entries` on top of `base` as one new block. Returns `base`
    /// when there is nothing to add.
    fn append_block(
        &mut self,
        room_nid: RoomNid,
        base: StateSnapshotNid,
        entries: &[StateEntry],
        max_blocks: usize,
    ) -> RoomServerResult<StateSnapshotNid> {
        if entries.is_empty() {
            return Ok(base);
        }
        let mut blocks = self.snapshot_blocks(base)?;
        if blocks.len() + 1 > max_blocks.max(1) {
            let mut state = self.load_snapshot(base)?;
            for entry in entries {
                state.insert(entry.key, entry.event_nid);
            }
            return self.write_full_state(room_nid, &state);
        }
        blocks.push(self.insert_state_block(entries)?);
        Ok(self.insert_state_snapshot(room_nid, &blocks)?)
    }

    /// Stores `state` as a snapshot layered on `base`. Returns `base` when
    /// the states are equal.
    fn store_state(
        &mut self,
        room_nid: RoomNid,
        base: StateSnapshotNid,
        state: &StateMap,
        max_blocks: usize,
    ) -> RoomServerResult<StateSnapshotNid> {
        let base_state = self.load_snapshot(base)?;
        let delta = state_diff(&base_state, state);
        if delta.is_empty() {
            return Ok(base);
        }
        // A block can override a slot but never clear one.
        let clears_slots = delta.removed.iter().any(|e| !state.contains_key(&e.key));
        if base.is_empty() || clears_slots {
            return self.write_full_state(room_nid, state);
        }
        self.append_block(room_nid, base, &delta.added, max_blocks)
    }

    /// Writes `state` as a snapshot of a single block.
    fn write_full_state(
        &mut self,
        room_nid: RoomNid,
        state: &StateMap,
    ) -> RoomServerResult<StateSnapshotNid> {
        let block = self.insert_state_block(&to_entries(state))?;
        Ok(self.insert_state_snapshot(room_nid, &[block])?)
    }
}

impl<T: Txn + ?Sized> StateStore for T {}
