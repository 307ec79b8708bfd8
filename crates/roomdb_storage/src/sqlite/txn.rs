//! Table implementations over one SQLite transaction.

use super::rows::{get, limit, parse_json, parse_json_opt, placeholders, to_json};
use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::tables::{
    EventsTable, NidTable, OutputRoomEventsTable, PreviousEventsTable, RoomsTable,
    StateBlocksTable, StateSnapshotsTable, StreamIdTable, Txn,
};
use crate::types::{
    normalize_entries, state_block_hash, EventNid, EventRow, EventStateKeyNid, EventTypeNid,
    LatestEvents, NewEvent, NidKind, OutputEventRow, OutputEventsQuery, RoomInfo, RoomNid,
    ScanOrder, StateBlockNid, StateBlockNidList, StateEntry, StateEntryList, StateKey,
    StateSnapshotNid, StreamPosition,
};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use rusqlite::{params, params_from_iter, Connection, Params, Row};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

const ROOMS: &str = "roomserver_rooms";
const EVENTS: &str = "roomserver_events";
const BLOCKS: &str = "roomserver_state_blocks";
const SNAPSHOTS: &str = "roomserver_state_snapshots";
const OUTPUT: &str = "syncapi_output_room_events";

const INSERT_ROOM: &str = "INSERT INTO roomserver_rooms (room_id, room_version) VALUES (?1, ?2) \
     ON CONFLICT(room_id) DO NOTHING";

const SELECT_ROOM_NID: &str = "SELECT room_nid FROM roomserver_rooms WHERE room_id = ?1";

const SELECT_ROOM_INFO: &str = "SELECT room_nid, room_id, room_version, latest_event_nids, \
     last_event_sent_nid, state_snapshot_nid FROM roomserver_rooms WHERE room_id = ?1";

const SELECT_ROOM_VERSION: &str = "SELECT room_version FROM roomserver_rooms WHERE room_nid = ?1";

const SELECT_LATEST_EVENTS: &str = "SELECT latest_event_nids, last_event_sent_nid, \
     state_snapshot_nid FROM roomserver_rooms WHERE room_nid = ?1";

const UPDATE_LATEST_EVENTS: &str = "UPDATE roomserver_rooms SET latest_event_nids = ?2, \
     last_event_sent_nid = ?3, state_snapshot_nid = ?4 WHERE room_nid = ?1";

const INSERT_EVENT: &str = "INSERT INTO roomserver_events (room_nid, event_type_nid, \
     event_state_key_nid, event_id, depth, prev_event_nids, state_snapshot_nid, event_json) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) ON CONFLICT(event_id) DO NOTHING";

const SELECT_EVENT_NID: &str = "SELECT event_nid FROM roomserver_events WHERE event_id = ?1";

const EVENT_COLUMNS: &str = "event_nid, room_nid, event_id, event_type_nid, \
     event_state_key_nid, depth, prev_event_nids, state_snapshot_nid, event_json";

const INSERT_PREVIOUS_EVENT: &str = "INSERT INTO roomserver_previous_events \
     (previous_event_id, event_nid) VALUES (?1, ?2) ON CONFLICT DO NOTHING";

const SELECT_PREVIOUS_EVENT_EXISTS: &str =
    "SELECT 1 FROM roomserver_previous_events WHERE previous_event_id = ?1 LIMIT 1";

const INSERT_STATE_BLOCK: &str = "INSERT INTO roomserver_state_blocks \
     (state_block_hash, entries) VALUES (?1, ?2) ON CONFLICT(state_block_hash) DO NOTHING";

const SELECT_STATE_BLOCK_BY_HASH: &str =
    "SELECT state_block_nid FROM roomserver_state_blocks WHERE state_block_hash = ?1";

const INSERT_STATE_SNAPSHOT: &str = "INSERT INTO roomserver_state_snapshots \
     (room_nid, state_block_nids) VALUES (?1, ?2)";

const INSERT_OUTPUT_EVENT: &str = "INSERT INTO syncapi_output_room_events (id, room_id, \
     event_id, headered_event_json, type, sender, contains_url, add_state_ids, \
     remove_state_ids, session_id, transaction_id, exclude_from_sync) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const UPDATE_EXCLUDE_FROM_SYNC: &str =
    "UPDATE syncapi_output_room_events SET exclude_from_sync = ?2 WHERE event_id = ?1";

const SELECT_OUTPUT_POSITION: &str =
    "SELECT id FROM syncapi_output_room_events WHERE event_id = ?1";

/// Columns of an output row, in the order `decode_output` reads them.
macro_rules! output_columns {
    () => {
        "id, room_id, event_id, headered_event_json, type, sender, contains_url, \
         add_state_ids, remove_state_ids, session_id, transaction_id, exclude_from_sync"
    };
}

const OUTPUT_COLUMNS: &str = output_columns!();

const SELECT_RECENT_EVENTS: &str = concat!(
    "SELECT ",
    output_columns!(),
    " FROM syncapi_output_room_events \
     WHERE room_id = ?1 AND id > ?2 AND id <= ?3 ORDER BY id DESC LIMIT ?4"
);

const SELECT_RECENT_EVENTS_FOR_SYNC: &str = concat!(
    "SELECT ",
    output_columns!(),
    " FROM syncapi_output_room_events \
     WHERE room_id = ?1 AND id > ?2 AND id <= ?3 AND exclude_from_sync = FALSE \
     ORDER BY id DESC LIMIT ?4"
);

const SELECT_EARLY_EVENTS: &str = concat!(
    "SELECT ",
    output_columns!(),
    " FROM syncapi_output_room_events \
     WHERE room_id = ?1 AND id > ?2 AND id <= ?3 ORDER BY id ASC LIMIT ?4"
);

const SELECT_EARLY_EVENTS_FOR_SYNC: &str = concat!(
    "SELECT ",
    output_columns!(),
    " FROM syncapi_output_room_events \
     WHERE room_id = ?1 AND id > ?2 AND id <= ?3 AND exclude_from_sync = FALSE \
     ORDER BY id ASC LIMIT ?4"
);

const SELECT_STATE_IN_RANGE: &str = concat!(
    "SELECT ",
    output_columns!(),
    " FROM syncapi_output_room_events \
     WHERE id > ?1 AND id <= ?2 \
     AND (add_state_ids IS NOT NULL OR remove_state_ids IS NOT NULL) \
     ORDER BY id ASC LIMIT ?3"
);

const SELECT_ROOM_IDS_IN_RANGE: &str = "SELECT DISTINCT room_id FROM syncapi_output_room_events \
     WHERE id > ?1 AND id <= ?2 AND exclude_from_sync = 0 ORDER BY room_id ASC";

const SELECT_MAX_POSITION: &str = "SELECT MAX(id) FROM syncapi_output_room_events";

const INCREMENT_STREAM_ID: &str =
    "UPDATE syncapi_stream_id SET stream_id = stream_id + 1 WHERE stream_name = ?1";

const INSERT_STREAM_ID: &str =
    "INSERT INTO syncapi_stream_id (stream_name, stream_id) VALUES (?1, 1)";

const SELECT_STREAM_ID: &str = "SELECT stream_id FROM syncapi_stream_id WHERE stream_name = ?1";

/// Table, NID column and string column of a NID table.
fn nid_table(kind: NidKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        NidKind::EventType => ("roomserver_event_types", "event_type_nid", "event_type"),
        NidKind::EventStateKey => (
            "roomserver_event_state_keys",
            "event_state_key_nid",
            "event_state_key",
        ),
    }
}

pub(super) struct SqliteTxn {
    conn: ArcMutexGuard<RawMutex, Connection>,
    ctx: Context,
    finished: bool,
}

impl SqliteTxn {
    pub(super) fn new(conn: ArcMutexGuard<RawMutex, Connection>, ctx: Context) -> Self {
        Self {
            conn,
            ctx,
            finished: false,
        }
    }

    fn query_one<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        decode: impl FnOnce(&Row<'_>) -> StorageResult<T>,
    ) -> StorageResult<Option<T>> {
        self.ctx.check()?;
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => decode(row).map(Some),
            None => Ok(None),
        }
    }

    fn query_all<T, P: Params>(
        &self,
        sql: &str,
        params: P,
        mut decode: impl FnMut(&Row<'_>) -> StorageResult<T>,
    ) -> StorageResult<Vec<T>> {
        self.ctx.check()?;
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode(row)?);
        }
        Ok(out)
    }

    fn execute<P: Params>(&self, sql: &str, params: P) -> StorageResult<usize> {
        self.ctx.check()?;
        Ok(self.conn.prepare_cached(sql)?.execute(params)?)
    }

    fn latest_events(&self, room_nid: RoomNid) -> StorageResult<LatestEvents> {
        self.query_one(SELECT_LATEST_EVENTS, [room_nid.0], |row| {
            let latest: String = get(row, 0, ROOMS, "latest_event_nids")?;
            Ok(LatestEvents {
                latest_event_nids: parse_json(&latest, ROOMS, "latest_event_nids")?,
                last_event_sent_nid: EventNid(get(row, 1, ROOMS, "last_event_sent_nid")?),
                state_snapshot_nid: StateSnapshotNid(get(row, 2, ROOMS, "state_snapshot_nid")?),
            })
        })?
        .ok_or_else(|| StorageError::not_found(format!("{room_nid}")))
    }
}

fn decode_event(row: &Row<'_>) -> StorageResult<EventRow> {
    let prev: String = get(row, 6, EVENTS, "prev_event_nids")?;
    Ok(EventRow {
        event_nid: EventNid(get(row, 0, EVENTS, "event_nid")?),
        room_nid: RoomNid(get(row, 1, EVENTS, "room_nid")?),
        event_id: get(row, 2, EVENTS, "event_id")?,
        event_type_nid: EventTypeNid(get(row, 3, EVENTS, "event_type_nid")?),
        event_state_key_nid: get::<Option<i64>>(row, 4, EVENTS, "event_state_key_nid")?
            .map(EventStateKeyNid),
        depth: get(row, 5, EVENTS, "depth")?,
        prev_event_nids: parse_json(&prev, EVENTS, "prev_event_nids")?,
        state_snapshot_nid: StateSnapshotNid(get(row, 7, EVENTS, "state_snapshot_nid")?),
        event_json: get(row, 8, EVENTS, "event_json")?,
    })
}

fn decode_output(row: &Row<'_>) -> StorageResult<OutputEventRow> {
    Ok(OutputEventRow {
        position: StreamPosition(get(row, 0, OUTPUT, "id")?),
        room_id: get(row, 1, OUTPUT, "room_id")?,
        event_id: get(row, 2, OUTPUT, "event_id")?,
        event_json: get(row, 3, OUTPUT, "headered_event_json")?,
        event_type: get(row, 4, OUTPUT, "type")?,
        sender: get(row, 5, OUTPUT, "sender")?,
        contains_url: get(row, 6, OUTPUT, "contains_url")?,
        add_state_ids: parse_json_opt(
            get(row, 7, OUTPUT, "add_state_ids")?,
            OUTPUT,
            "add_state_ids",
        )?,
        remove_state_ids: parse_json_opt(
            get(row, 8, OUTPUT, "remove_state_ids")?,
            OUTPUT,
            "remove_state_ids",
        )?,
        session_id: get(row, 9, OUTPUT, "session_id")?,
        transaction_id: get(row, 10, OUTPUT, "transaction_id")?,
        exclude_from_sync: get(row, 11, OUTPUT, "exclude_from_sync")?,
    })
}

/// Fails with `NotFound` unless every requested NID came back.
fn check_all_found<T>(
    requested: &BTreeSet<i64>,
    found: &[T],
    nid_of: impl Fn(&T) -> i64,
    what: &str,
) -> StorageResult<()> {
    if found.len() == requested.len() {
        return Ok(());
    }
    let found: BTreeSet<i64> = found.iter().map(nid_of).collect();
    let missing: Vec<i64> = requested.difference(&found).copied().collect();
    Err(StorageError::not_found(format!("{what} {missing:?}")))
}

impl Drop for SqliteTxn {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback of abandoned sqlite transaction failed");
            }
        }
    }
}

impl Txn for SqliteTxn {
    fn context(&self) -> &Context {
        &self.ctx
    }

    fn commit(mut self: Box<Self>) -> StorageResult<()> {
        self.ctx.check()?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        debug!("sqlite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl RoomsTable for SqliteTxn {
    fn insert_room_nid(&mut self, room_id: &str, room_version: &str) -> StorageResult<RoomNid> {
        self.execute(INSERT_ROOM, params![room_id, room_version])?;
        self.select_room_nid(room_id)?
            .ok_or_else(|| StorageError::not_found(format!("room {room_id}")))
    }

    fn select_room_nid(&self, room_id: &str) -> StorageResult<Option<RoomNid>> {
        self.query_one(SELECT_ROOM_NID, [room_id], |row| {
            Ok(RoomNid(get(row, 0, ROOMS, "room_nid")?))
        })
    }

    fn select_room_info(&self, room_id: &str) -> StorageResult<Option<RoomInfo>> {
        self.query_one(SELECT_ROOM_INFO, [room_id], |row| {
            let latest: String = get(row, 3, ROOMS, "latest_event_nids")?;
            Ok(RoomInfo {
                room_nid: RoomNid(get(row, 0, ROOMS, "room_nid")?),
                room_id: get(row, 1, ROOMS, "room_id")?,
                room_version: get(row, 2, ROOMS, "room_version")?,
                latest: LatestEvents {
                    latest_event_nids: parse_json(&latest, ROOMS, "latest_event_nids")?,
                    last_event_sent_nid: EventNid(get(row, 4, ROOMS, "last_event_sent_nid")?),
                    state_snapshot_nid: StateSnapshotNid(get(
                        row,
                        5,
                        ROOMS,
                        "state_snapshot_nid",
                    )?),
                },
            })
        })
    }

    fn select_room_version(&self, room_nid: RoomNid) -> StorageResult<String> {
        self.query_one(SELECT_ROOM_VERSION, [room_nid.0], |row| {
            get(row, 0, ROOMS, "room_version")
        })?
        .ok_or_else(|| StorageError::not_found(format!("{room_nid}")))
    }

    fn select_latest_event_nids(
        &self,
        room_nid: RoomNid,
    ) -> StorageResult<(Vec<EventNid>, StateSnapshotNid)> {
        let latest = self.latest_events(room_nid)?;
        Ok((latest.latest_event_nids, latest.state_snapshot_nid))
    }

    fn select_latest_events_for_update(
        &mut self,
        room_nid: RoomNid,
    ) -> StorageResult<LatestEvents> {
        // BEGIN IMMEDIATE already holds the database write lock.
        self.latest_events(room_nid)
    }

    fn update_latest_event_nids(
        &mut self,
        room_nid: RoomNid,
        latest: &LatestEvents,
    ) -> StorageResult<()> {
        let changed = self.execute(
            UPDATE_LATEST_EVENTS,
            params![
                room_nid.0,
                to_json(&latest.latest_event_nids)?,
                latest.last_event_sent_nid.0,
                latest.state_snapshot_nid.0,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found(format!("{room_nid}")));
        }
        Ok(())
    }
}

impl NidTable for SqliteTxn {
    fn insert_nid(&mut self, kind: NidKind, id: &str) -> StorageResult<i64> {
        let (table, _, column) = nid_table(kind);
        let sql = format!("INSERT INTO {table} ({column}) VALUES (?1) ON CONFLICT DO NOTHING");
        self.execute(&sql, [id])?;
        self.select_nid(kind, id)?
            .ok_or_else(|| StorageError::not_found(format!("{table} {id:?}")))
    }

    fn select_nid(&self, kind: NidKind, id: &str) -> StorageResult<Option<i64>> {
        let (table, nid_column, column) = nid_table(kind);
        let sql = format!("SELECT {nid_column} FROM {table} WHERE {column} = ?1");
        self.query_one(&sql, [id], |row| get(row, 0, table, nid_column))
    }

    fn bulk_select_nids(
        &self,
        kind: NidKind,
        ids: &[String],
    ) -> StorageResult<HashMap<String, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (table, nid_column, column) = nid_table(kind);
        let sql = format!(
            "SELECT {column}, {nid_column} FROM {table} WHERE {column} IN ({})",
            placeholders(ids.len())
        );
        let pairs: Vec<(String, i64)> =
            self.query_all(&sql, params_from_iter(ids.iter()), |row| {
            Ok((get(row, 0, table, column)?, get(row, 1, table, nid_column)?))
        })?;
        Ok(pairs.into_iter().collect())
    }

    fn bulk_select_strings(
        &self,
        kind: NidKind,
        nids: &[i64],
    ) -> StorageResult<HashMap<i64, String>> {
        if nids.is_empty() {
            return Ok(HashMap::new());
        }
        let (table, nid_column, column) = nid_table(kind);
        let sql = format!(
            "SELECT {nid_column}, {column} FROM {table} WHERE {nid_column} IN ({})",
            placeholders(nids.len())
        );
        let pairs: Vec<(i64, String)> =
            self.query_all(&sql, params_from_iter(nids.iter()), |row| {
            Ok((get(row, 0, table, nid_column)?, get(row, 1, table, column)?))
        })?;
        Ok(pairs.into_iter().collect())
    }
}

impl EventsTable for SqliteTxn {
    fn insert_event(&mut self, event: &NewEvent) -> StorageResult<(EventNid, bool)> {
        let changed = self.execute(
            INSERT_EVENT,
            params![
                event.room_nid.0,
                event.event_type_nid.0,
                event.event_state_key_nid.map(|nid| nid.0),
                event.event_id,
                event.depth,
                to_json(&event.prev_event_nids)?,
                event.state_snapshot_nid.0,
                event.event_json,
            ],
        )?;
        if changed == 1 {
            return Ok((EventNid(self.conn.last_insert_rowid()), true));
        }
        let nid = self
            .select_event_nid(&event.event_id)?
            .ok_or_else(|| StorageError::not_found(format!("event {}", event.event_id)))?;
        Ok((nid, false))
    }

    fn select_event_nid(&self, event_id: &str) -> StorageResult<Option<EventNid>> {
        self.query_one(SELECT_EVENT_NID, [event_id], |row| {
            Ok(EventNid(get(row, 0, EVENTS, "event_nid")?))
        })
    }

    fn bulk_select_event_nids(
        &self,
        event_ids: &[String],
    ) -> StorageResult<HashMap<String, EventNid>> {
        if event_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT event_id, event_nid FROM roomserver_events WHERE event_id IN ({})",
            placeholders(event_ids.len())
        );
        let pairs: Vec<(String, EventNid)> =
            self.query_all(&sql, params_from_iter(event_ids.iter()), |row| {
            Ok((
                get(row, 0, EVENTS, "event_id")?,
                EventNid(get(row, 1, EVENTS, "event_nid")?),
            ))
        })?;
        Ok(pairs.into_iter().collect())
    }

    fn bulk_select_events(&self, event_nids: &[EventNid]) -> StorageResult<Vec<EventRow>> {
        if event_nids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM roomserver_events WHERE event_nid IN ({}) \
             ORDER BY event_nid ASC",
            placeholders(event_nids.len())
        );
        self.query_all(&sql, params_from_iter(event_nids.iter().map(|n| n.0)), decode_event)
    }

    fn bulk_select_events_by_id(&self, event_ids: &[String]) -> StorageResult<Vec<EventRow>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM roomserver_events WHERE event_id IN ({}) \
             ORDER BY event_nid ASC",
            placeholders(event_ids.len())
        );
        self.query_all(&sql, params_from_iter(event_ids.iter()), decode_event)
    }
}

impl PreviousEventsTable for SqliteTxn {
    fn insert_previous_event(
        &mut self,
        previous_event_id: &str,
        event_nid: EventNid,
    ) -> StorageResult<()> {
        self.execute(INSERT_PREVIOUS_EVENT, params![previous_event_id, event_nid.0])?;
        Ok(())
    }

    fn select_previous_event_exists(&self, event_id: &str) -> StorageResult<bool> {
        Ok(self
            .query_one(SELECT_PREVIOUS_EVENT_EXISTS, [event_id], |_| Ok(()))?
            .is_some())
    }
}

impl StateBlocksTable for SqliteTxn {
    fn insert_state_block(&mut self, entries: &[StateEntry]) -> StorageResult<StateBlockNid> {
        let entries = normalize_entries(entries);
        let hash = state_block_hash(&entries);
        let encoded: Vec<[i64; 3]> = entries
            .iter()
            .map(|e| {
                [
                    e.key.event_type_nid.0,
                    e.key.event_state_key_nid.0,
                    e.event_nid.0,
                ]
            })
            .collect();
        self.execute(INSERT_STATE_BLOCK, params![&hash[..], to_json(&encoded)?])?;
        self.query_one(SELECT_STATE_BLOCK_BY_HASH, [&hash[..]], |row| {
            Ok(StateBlockNid(get(row, 0, BLOCKS, "state_block_nid")?))
        })?
        .ok_or_else(|| StorageError::not_found("state block by hash"))
    }

    fn bulk_select_state_block_entries(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<Vec<StateEntryList>> {
        let requested: BTreeSet<i64> = state_block_nids.iter().map(|n| n.0).collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT state_block_nid, entries FROM roomserver_state_blocks \
             WHERE state_block_nid IN ({}) ORDER BY state_block_nid ASC",
            placeholders(requested.len())
        );
        let lists = self.query_all(&sql, params_from_iter(requested.iter()), |row| {
            let raw: String = get(row, 1, BLOCKS, "entries")?;
            let triples: Vec<[i64; 3]> = parse_json(&raw, BLOCKS, "entries")?;
            Ok(StateEntryList {
                state_block_nid: StateBlockNid(get(row, 0, BLOCKS, "state_block_nid")?),
                entries: triples
                    .into_iter()
                    .map(|[t, k, e]| {
                        StateEntry::new(
                            StateKey::new(EventTypeNid(t), EventStateKeyNid(k)),
                            EventNid(e),
                        )
                    })
                    .collect(),
            })
        })?;
        check_all_found(&requested, &lists, |l| l.state_block_nid.0, "state blocks")?;
        Ok(lists)
    }
}

impl StateSnapshotsTable for SqliteTxn {
    fn insert_state_snapshot(
        &mut self,
        room_nid: RoomNid,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<StateSnapshotNid> {
        self.execute(
            INSERT_STATE_SNAPSHOT,
            params![room_nid.0, to_json(state_block_nids)?],
        )?;
        Ok(StateSnapshotNid(self.conn.last_insert_rowid()))
    }

    fn bulk_select_state_block_nids(
        &self,
        state_snapshot_nids: &[StateSnapshotNid],
    ) -> StorageResult<Vec<StateBlockNidList>> {
        let requested: BTreeSet<i64> = state_snapshot_nids.iter().map(|n| n.0).collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT state_snapshot_nid, state_block_nids FROM roomserver_state_snapshots \
             WHERE state_snapshot_nid IN ({}) ORDER BY state_snapshot_nid ASC",
            placeholders(requested.len())
        );
        let lists = self.query_all(&sql, params_from_iter(requested.iter()), |row| {
            let raw: String = get(row, 1, SNAPSHOTS, "state_block_nids")?;
            Ok(StateBlockNidList {
                state_snapshot_nid: StateSnapshotNid(get(row, 0, SNAPSHOTS, "state_snapshot_nid")?),
                state_block_nids: parse_json(&raw, SNAPSHOTS, "state_block_nids")?,
            })
        })?;
        check_all_found(&requested, &lists, |l| l.state_snapshot_nid.0, "state snapshots")?;
        Ok(lists)
    }
}

impl OutputRoomEventsTable for SqliteTxn {
    fn insert_output_event(&mut self, row: &OutputEventRow) -> StorageResult<()> {
        let add = row.add_state_ids.as_ref().map(to_json).transpose()?;
        let remove = row.remove_state_ids.as_ref().map(to_json).transpose()?;
        self.execute(
            INSERT_OUTPUT_EVENT,
            params![
                row.position.0,
                row.room_id,
                row.event_id,
                row.event_json,
                row.event_type,
                row.sender,
                row.contains_url,
                add,
                remove,
                row.session_id,
                row.transaction_id,
                row.exclude_from_sync,
            ],
        )?;
        Ok(())
    }

    fn update_exclude_from_sync(&mut self, event_id: &str, exclude: bool) -> StorageResult<()> {
        let changed = self.execute(UPDATE_EXCLUDE_FROM_SYNC, params![event_id, exclude])?;
        if changed == 0 {
            return Err(StorageError::not_found(format!("output row for {event_id}")));
        }
        Ok(())
    }

    fn select_output_position(&self, event_id: &str) -> StorageResult<Option<StreamPosition>> {
        self.query_one(SELECT_OUTPUT_POSITION, [event_id], |row| {
            Ok(StreamPosition(get(row, 0, OUTPUT, "id")?))
        })
    }

    fn select_output_events(
        &self,
        query: &OutputEventsQuery<'_>,
    ) -> StorageResult<Vec<OutputEventRow>> {
        if query.low >= query.high || query.limit == 0 {
            return Ok(Vec::new());
        }
        let sql = match (query.order, query.only_sync_visible) {
            (ScanOrder::Descending, false) => SELECT_RECENT_EVENTS,
            (ScanOrder::Descending, true) => SELECT_RECENT_EVENTS_FOR_SYNC,
            (ScanOrder::Ascending, false) => SELECT_EARLY_EVENTS,
            (ScanOrder::Ascending, true) => SELECT_EARLY_EVENTS_FOR_SYNC,
        };
        self.query_all(
            sql,
            params![query.room_id, query.low.0, query.high.0, limit(query.limit)],
            decode_output,
        )
    }

    fn select_state_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
        max: usize,
    ) -> StorageResult<Vec<OutputEventRow>> {
        if low >= high || max == 0 {
            return Ok(Vec::new());
        }
        self.query_all(
            SELECT_STATE_IN_RANGE,
            params![low.0, high.0, limit(max)],
            decode_output,
        )
    }

    fn select_room_ids_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
    ) -> StorageResult<Vec<String>> {
        if low >= high {
            return Ok(Vec::new());
        }
        self.query_all(SELECT_ROOM_IDS_IN_RANGE, params![low.0, high.0], |row| {
            get(row, 0, OUTPUT, "room_id")
        })
    }

    fn select_output_events_by_id(
        &self,
        event_ids: &[String],
    ) -> StorageResult<Vec<OutputEventRow>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {OUTPUT_COLUMNS} FROM syncapi_output_room_events \
             WHERE event_id IN ({}) ORDER BY id ASC",
            placeholders(event_ids.len())
        );
        self.query_all(&sql, params_from_iter(event_ids.iter()), decode_output)
    }

    fn select_max_position(&self) -> StorageResult<StreamPosition> {
        let max = self.query_one(SELECT_MAX_POSITION, [], |row| {
            get::<Option<i64>>(row, 0, OUTPUT, "id")
        })?;
        Ok(StreamPosition(max.flatten().unwrap_or(0)))
    }
}

impl StreamIdTable for SqliteTxn {
    fn next_stream_position(&mut self, stream: &str) -> StorageResult<StreamPosition> {
        if self.execute(INCREMENT_STREAM_ID, [stream])? == 0 {
            self.execute(INSERT_STREAM_ID, [stream])?;
        }
        self.select_stream_position(stream)
    }

    fn select_stream_position(&self, stream: &str) -> StorageResult<StreamPosition> {
        let value = self.query_one(SELECT_STREAM_ID, [stream], |row| {
            get(row, 0, "syncapi_stream_id", "stream_id")
        })?;
        Ok(StreamPosition(value.unwrap_or(0)))
    }
}
