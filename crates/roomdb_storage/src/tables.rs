//! The abstract table interface.
//!
//! Every engine implements each table trait on its transaction type. The
//! core only ever talks to a [`Txn`], so it never sees engine-specific SQL.

use crate::context::Context;
use crate::error::StorageResult;
use crate::types::{
    EventNid, EventRow, LatestEvents, NewEvent, NidKind, OutputEventRow, OutputEventsQuery,
    RoomInfo, RoomNid, StateBlockNid, StateBlockNidList, StateEntry, StateEntryList,
    StateSnapshotNid, StreamPosition,
};
use std::collections::HashMap;
use std::fmt;

/// A transactional store.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Transactions on different rooms
/// run concurrently; writers to the same room serialize on the room lock.
pub trait Store: Send + Sync + fmt::Debug {
    /// Starts a transaction. Every operation on it checks `ctx`.
    fn begin<'a>(&'a self, ctx: &Context) -> StorageResult<Box<dyn Txn + 'a>>;

    /// Returns the engine name, e.g. `"memory"` or `"sqlite"`.
    fn engine(&self) -> &'static str;
}

/// An open transaction. Dropping it without committing rolls it back.
pub trait Txn:
    RoomsTable
    + NidTable
    + EventsTable
    + PreviousEventsTable
    + StateBlocksTable
    + StateSnapshotsTable
    + OutputRoomEventsTable
    + StreamIdTable
{
    /// Returns the context the transaction was started with.
    fn context(&self) -> &Context;

    /// Makes every write of this transaction visible and releases its locks.
    fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards every write of this transaction and releases its locks.
    fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Room rows.
pub trait RoomsTable {
    /// Inserts a room if absent and returns its NID.
    fn insert_room_nid(&mut self, room_id: &str, room_version: &str) -> StorageResult<RoomNid>;

    /// Looks up a room NID.
    fn select_room_nid(&self, room_id: &str) -> StorageResult<Option<RoomNid>>;

    /// Reads a whole room row.
    fn select_room_info(&self, room_id: &str) -> StorageResult<Option<RoomInfo>>;

    /// Reads the version of a room. Fails with `NotFound` for unknown rooms.
    fn select_room_version(&self, room_nid: RoomNid) -> StorageResult<String>;

    /// Reads the latest events and current snapshot without locking.
    fn select_latest_event_nids(
        &self,
        room_nid: RoomNid,
    ) -> StorageResult<(Vec<EventNid>, StateSnapshotNid)>;

    /// Locks the room row until the transaction ends, then reads it.
    fn select_latest_events_for_update(&mut self, room_nid: RoomNid)
        -> StorageResult<LatestEvents>;

    /// Rewrites the mutable pointers of a room.
    fn update_latest_event_nids(
        &mut self,
        room_nid: RoomNid,
        latest: &LatestEvents,
    ) -> StorageResult<()>;
}

/// Event type and state key NIDs.
pub trait NidTable {
    /// Inserts a string if absent and returns its NID.
    fn insert_nid(&mut self, kind: NidKind, id: &str) -> StorageResult<i64>;

    /// Looks up one NID.
    fn select_nid(&self, kind: NidKind, id: &str) -> StorageResult<Option<i64>>;

    /// Looks up many NIDs. Unknown strings are omitted.
    fn bulk_select_nids(&self, kind: NidKind, ids: &[String])
        -> StorageResult<HashMap<String, i64>>;

    /// Reverse lookup. Unknown NIDs are omitted.
    fn bulk_select_strings(&self, kind: NidKind, nids: &[i64])
        -> StorageResult<HashMap<i64, String>>;
}

/// Event rows.
pub trait EventsTable {
    /// Inserts an event keyed by event ID. Returns its NID and whether this
    /// call inserted it.
    fn insert_event(&mut self, event: &NewEvent) -> StorageResult<(EventNid, bool)>;

    /// Looks up one event NID.
    fn select_event_nid(&self, event_id: &str) -> StorageResult<Option<EventNid>>;

    /// Looks up many event NIDs. Unknown IDs are omitted.
    fn bulk_select_event_nids(&self, event_ids: &[String])
        -> StorageResult<HashMap<String, EventNid>>;

    /// Reads events by NID, sorted by NID. Unknown NIDs are omitted.
    fn bulk_select_events(&self, event_nids: &[EventNid]) -> StorageResult<Vec<EventRow>>;

    /// Reads events by ID, sorted by NID. Unknown IDs are omitted.
    fn bulk_select_events_by_id(&self, event_ids: &[String]) -> StorageResult<Vec<EventRow>>;
}

/// Links from a previous event ID to the events that reference it.
pub trait PreviousEventsTable {
    /// Records that `event_nid` lists `previous_event_id` as a prev event.
    fn insert_previous_event(
        &mut self,
        previous_event_id: &str,
        event_nid: EventNid,
    ) -> StorageResult<()>;

    /// Returns true if any stored event references `event_id`.
    fn select_previous_event_exists(&self, event_id: &str) -> StorageResult<bool>;
}

/// Content-addressed state blocks.
pub trait StateBlocksTable {
    /// Stores a block, reusing an identical existing one.
    fn insert_state_block(&mut self, entries: &[StateEntry]) -> StorageResult<StateBlockNid>;

    /// Reads blocks, sorted by NID. A missing NID fails with `NotFound`.
    fn bulk_select_state_block_entries(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<Vec<StateEntryList>>;
}

/// State snapshots.
pub trait StateSnapshotsTable {
    /// Stores a new snapshot.
    fn insert_state_snapshot(
        &mut self,
        room_nid: RoomNid,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<StateSnapshotNid>;

    /// Reads snapshots, sorted by NID. A missing NID fails with `NotFound`.
    fn bulk_select_state_block_nids(
        &self,
        state_snapshot_nids: &[StateSnapshotNid],
    ) -> StorageResult<Vec<StateBlockNidList>>;
}

/// Output log rows.
pub trait OutputRoomEventsTable {
    /// Inserts a row at `row.position`.
    fn insert_output_event(&mut self, row: &OutputEventRow) -> StorageResult<()>;

    /// Rewrites the exclude flag of an existing row.
    fn update_exclude_from_sync(&mut self, event_id: &str, exclude: bool) -> StorageResult<()>;

    /// Looks up the position of an event.
    fn select_output_position(&self, event_id: &str) -> StorageResult<Option<StreamPosition>>;

    /// Bounded scan of one room in the order the query asks for.
    fn select_output_events(
        &self,
        query: &OutputEventsQuery<'_>,
    ) -> StorageResult<Vec<OutputEventRow>>;

    /// State-carrying rows of every room in `low < position <= high`,
    /// ascending.
    fn select_state_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
        limit: usize,
    ) -> StorageResult<Vec<OutputEventRow>>;

    /// Distinct rooms with a sync-visible row in `low < position <= high`,
    /// sorted.
    fn select_room_ids_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
    ) -> StorageResult<Vec<String>>;

    /// Reads rows by event ID, sorted by position.
    fn select_output_events_by_id(&self, event_ids: &[String])
        -> StorageResult<Vec<OutputEventRow>>;

    /// Highest position in the log, zero when empty.
    fn select_max_position(&self) -> StorageResult<StreamPosition>;
}

/// Named counters.
pub trait StreamIdTable {
    /// Locks the counter row until the transaction ends, increments it and
    /// returns the new value.
    fn next_stream_position(&mut self, stream: &str) -> StorageResult<StreamPosition>;

    /// Reads a counter without locking.
    fn select_stream_position(&self, stream: &str) -> StorageResult<StreamPosition>;
}
