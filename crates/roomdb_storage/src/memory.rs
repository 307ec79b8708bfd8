//! In-memory engine.
//!
//! Committed rows live behind one `RwLock`. A transaction buffers its writes
//! in an overlay that is merged under the write lock at commit. Row locks
//! (room rows and stream counters) are `Arc<Mutex<()>>` guards owned by the
//! transaction, so they are released exactly when it ends.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::tables::{
    EventsTable, NidTable, OutputRoomEventsTable, PreviousEventsTable, RoomsTable,
    StateBlocksTable, StateSnapshotsTable, Store, StreamIdTable, Txn,
};
use crate::types::{
    normalize_entries, state_block_hash, EventNid, EventRow, LatestEvents, NewEvent, NidKind,
    OutputEventRow, OutputEventsQuery, RoomInfo, RoomNid, ScanOrder, StateBlockNid,
    StateBlockNidList, StateEntry, StateEntryList, StateSnapshotNid, StreamPosition,
};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

type RowGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Room(RoomNid),
    Stream(String),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(nid) => write!(f, "{nid}"),
            Self::Stream(name) => write!(f, "stream:{name}"),
        }
    }
}

#[derive(Debug, Default)]
struct NidMap {
    by_id: HashMap<String, i64>,
    by_nid: HashMap<i64, String>,
    next: i64,
}

impl NidMap {
    fn seeded(rows: &[(&str, i64)]) -> Self {
        let mut map = Self::default();
        for (id, nid) in rows {
            map.by_id.insert((*id).to_string(), *nid);
            map.by_nid.insert(*nid, (*id).to_string());
            map.next = map.next.max(*nid);
        }
        map.next += 1;
        map
    }

    fn get_or_insert(&mut self, id: &str) -> i64 {
        if let Some(nid) = self.by_id.get(id) {
            return *nid;
        }
        let nid = self.next;
        self.next += 1;
        self.by_id.insert(id.to_string(), nid);
        self.by_nid.insert(nid, id.to_string());
        nid
    }
}

#[derive(Debug)]
struct Tables {
    rooms: BTreeMap<RoomNid, RoomInfo>,
    room_ids: HashMap<String, RoomNid>,
    next_room_nid: i64,
    event_types: NidMap,
    state_keys: NidMap,
    events: BTreeMap<EventNid, EventRow>,
    event_ids: HashMap<String, EventNid>,
    previous: HashMap<String, BTreeSet<EventNid>>,
    blocks: BTreeMap<StateBlockNid, Vec<StateEntry>>,
    block_hashes: HashMap<[u8; 32], StateBlockNid>,
    snapshots: BTreeMap<StateSnapshotNid, Vec<StateBlockNid>>,
    output: BTreeMap<StreamPosition, OutputEventRow>,
    output_ids: HashMap<String, StreamPosition>,
    output_rooms: HashMap<String, BTreeSet<StreamPosition>>,
    streams: HashMap<String, i64>,
}

impl Tables {
    fn new() -> Self {
        Self {
            rooms: BTreeMap::new(),
            room_ids: HashMap::new(),
            next_room_nid: 1,
            event_types: NidMap::seeded(NidKind::EventType.preassigned()),
            state_keys: NidMap::seeded(NidKind::EventStateKey.preassigned()),
            events: BTreeMap::new(),
            event_ids: HashMap::new(),
            previous: HashMap::new(),
            blocks: BTreeMap::new(),
            block_hashes: HashMap::new(),
            snapshots: BTreeMap::new(),
            output: BTreeMap::new(),
            output_ids: HashMap::new(),
            output_rooms: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    fn nids(&self, kind: NidKind) -> &NidMap {
        match kind {
            NidKind::EventType => &self.event_types,
            NidKind::EventStateKey => &self.state_keys,
        }
    }

    fn nids_mut(&mut self, kind: NidKind) -> &mut NidMap {
        match kind {
            NidKind::EventType => &mut self.event_types,
            NidKind::EventStateKey => &mut self.state_keys,
        }
    }
}

/// Uncommitted writes of one transaction.
#[derive(Debug, Default)]
struct Overlay {
    new_rooms: BTreeMap<RoomNid, RoomInfo>,
    new_room_ids: HashMap<String, RoomNid>,
    rooms: HashMap<RoomNid, LatestEvents>,
    events: BTreeMap<EventNid, EventRow>,
    event_ids: HashMap<String, EventNid>,
    previous: Vec<(String, EventNid)>,
    previous_ids: HashSet<String>,
    blocks: BTreeMap<StateBlockNid, Vec<StateEntry>>,
    block_hashes: HashMap<[u8; 32], StateBlockNid>,
    snapshots: BTreeMap<StateSnapshotNid, Vec<StateBlockNid>>,
    output: BTreeMap<StreamPosition, OutputEventRow>,
    output_ids: HashMap<String, StreamPosition>,
    exclude_updates: HashMap<String, bool>,
    streams: HashMap<String, i64>,
}

#[derive(Debug)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    next_event_nid: AtomicI64,
    next_block_nid: AtomicI64,
    next_snapshot_nid: AtomicI64,
    lock_timeout: Option<Duration>,
}

/// An in-memory store.
///
/// Suitable for tests and ephemeral deployments. Clones share the same
/// tables.
///
/// # Example
///
/// ```rust
/// use roomdb_storage::{Context, MemoryStore, RoomsTable, Store};
///
/// let store = MemoryStore::new();
/// let ctx = Context::background();
/// let mut txn = store.begin(&ctx).unwrap();
/// let nid = txn.insert_room_nid("!room:example.org", "6").unwrap();
/// txn.commit().unwrap();
///
/// let txn = store.begin(&ctx).unwrap();
/// assert_eq!(txn.select_room_nid("!room:example.org").unwrap(), Some(nid));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store whose lock waits are bounded only by the
    /// caller's context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// Creates an empty store whose lock waits give up after `lock_timeout`.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::new()),
                row_locks: Mutex::new(HashMap::new()),
                next_event_nid: AtomicI64::new(1),
                next_block_nid: AtomicI64::new(1),
                next_snapshot_nid: AtomicI64::new(1),
                lock_timeout,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn begin<'a>(&'a self, ctx: &Context) -> StorageResult<Box<dyn Txn + 'a>> {
        ctx.check()?;
        Ok(Box::new(MemTxn {
            shared: &self.shared,
            ctx: ctx.clone(),
            overlay: Overlay::default(),
            held: HashMap::new(),
        }))
    }

    fn engine(&self) -> &'static str {
        "memory"
    }
}

struct MemTxn<'a> {
    shared: &'a Shared,
    ctx: Context,
    overlay: Overlay,
    held: HashMap<RowKey, RowGuard>,
}

impl MemTxn<'_> {
    fn lock_row(&mut self, key: RowKey) -> StorageResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let mutex = {
            let mut locks = self.shared.row_locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = match self.ctx.lock_budget(self.shared.lock_timeout) {
            None => mutex.lock_arc(),
            Some(budget) => mutex.try_lock_arc_for(budget).ok_or_else(|| {
                trace!(row = %key, ?budget, "row lock wait timed out");
                StorageError::conflict(format!("timed out waiting for lock on {key}"))
            })?,
        };
        self.held.insert(key, guard);
        Ok(())
    }

    fn latest(&self, room_nid: RoomNid) -> StorageResult<LatestEvents> {
        self.room(&self.shared.tables.read(), room_nid)
            .map(|room| room.latest)
            .ok_or_else(|| StorageError::not_found(format!("{room_nid}")))
    }

    /// The room row as this transaction sees it.
    fn room(&self, tables: &Tables, room_nid: RoomNid) -> Option<RoomInfo> {
        let mut room = self
            .overlay
            .new_rooms
            .get(&room_nid)
            .or_else(|| tables.rooms.get(&room_nid))
            .cloned()?;
        if let Some(latest) = self.overlay.rooms.get(&room_nid) {
            room.latest = latest.clone();
        }
        Some(room)
    }

    fn room_nid_of(&self, tables: &Tables, room_id: &str) -> Option<RoomNid> {
        self.overlay
            .new_room_ids
            .get(room_id)
            .or_else(|| tables.room_ids.get(room_id))
            .copied()
    }

    fn event_by_nid(&self, tables: &Tables, nid: EventNid) -> Option<EventRow> {
        self.overlay
            .events
            .get(&nid)
            .or_else(|| tables.events.get(&nid))
            .cloned()
    }

    fn event_nid(&self, tables: &Tables, event_id: &str) -> Option<EventNid> {
        self.overlay
            .event_ids
            .get(event_id)
            .or_else(|| tables.event_ids.get(event_id))
            .copied()
    }

    fn output_position(&self, tables: &Tables, event_id: &str) -> Option<StreamPosition> {
        self.overlay
            .output_ids
            .get(event_id)
            .or_else(|| tables.output_ids.get(event_id))
            .copied()
    }

    fn output_row(&self, tables: &Tables, position: StreamPosition) -> Option<OutputEventRow> {
        if let Some(row) = self.overlay.output.get(&position) {
            return Some(row.clone());
        }
        let mut row = tables.output.get(&position)?.clone();
        if let Some(exclude) = self.overlay.exclude_updates.get(&row.event_id) {
            row.exclude_from_sync = *exclude;
        }
        Some(row)
    }

    fn apply(tables: &mut Tables, overlay: Overlay) -> StorageResult<()> {
        for id in overlay.new_room_ids.keys() {
            if tables.room_ids.contains_key(id) {
                return Err(StorageError::conflict(format!(
                    "room {id} was created by a concurrent transaction"
                )));
            }
        }
        for id in overlay.event_ids.keys() {
            if tables.event_ids.contains_key(id) {
                return Err(StorageError::conflict(format!(
                    "event {id} was inserted by a concurrent transaction"
                )));
            }
        }
        for (id, position) in &overlay.output_ids {
            if tables.output_ids.contains_key(id) || tables.output.contains_key(position) {
                return Err(StorageError::conflict(format!(
                    "output row for {id} was inserted by a concurrent transaction"
                )));
            }
        }
        for hash in overlay.block_hashes.keys() {
            if tables.block_hashes.contains_key(hash) {
                return Err(StorageError::conflict(
                    "state block was inserted by a concurrent transaction",
                ));
            }
        }

        tables.room_ids.extend(overlay.new_room_ids);
        tables.rooms.extend(overlay.new_rooms);
        for (room_nid, latest) in overlay.rooms {
            if let Some(room) = tables.rooms.get_mut(&room_nid) {
                room.latest = latest;
            }
        }
        for (nid, row) in overlay.events {
            tables.event_ids.insert(row.event_id.clone(), nid);
            tables.events.insert(nid, row);
        }
        for (previous_id, nid) in overlay.previous {
            tables.previous.entry(previous_id).or_default().insert(nid);
        }
        tables.blocks.extend(overlay.blocks);
        tables.block_hashes.extend(overlay.block_hashes);
        tables.snapshots.extend(overlay.snapshots);
        for (position, row) in overlay.output {
            tables.output_ids.insert(row.event_id.clone(), position);
            tables
                .output_rooms
                .entry(row.room_id.clone())
                .or_default()
                .insert(position);
            tables.output.insert(position, row);
        }
        for (event_id, exclude) in overlay.exclude_updates {
            if let Some(position) = tables.output_ids.get(&event_id) {
                if let Some(row) = tables.output.get_mut(position) {
                    row.exclude_from_sync = exclude;
                }
            }
        }
        tables.streams.extend(overlay.streams);
        Ok(())
    }
}

impl Txn for MemTxn<'_> {
    fn context(&self) -> &Context {
        &self.ctx
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = *self;
        this.ctx.check()?;
        let overlay = std::mem::take(&mut this.overlay);
        let events = overlay.events.len();
        let outputs = overlay.output.len();
        Self::apply(&mut this.shared.tables.write(), overlay)?;
        debug!(events, outputs, locks = this.held.len(), "memory transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StorageResult<()> {
        trace!(locks = self.held.len(), "memory transaction rolled back");
        Ok(())
    }
}

impl RoomsTable for MemTxn<'_> {
    fn insert_room_nid(&mut self, room_id: &str, room_version: &str) -> StorageResult<RoomNid> {
        self.ctx.check()?;
        // The NID is drawn eagerly, the row itself only lands on commit.
        let nid = {
            let mut tables = self.shared.tables.write();
            if let Some(nid) = self.room_nid_of(&tables, room_id) {
                return Ok(nid);
            }
            let nid = RoomNid(tables.next_room_nid);
            tables.next_room_nid += 1;
            nid
        };
        self.overlay.new_room_ids.insert(room_id.to_string(), nid);
        self.overlay.new_rooms.insert(
            nid,
            RoomInfo {
                room_nid: nid,
                room_id: room_id.to_string(),
                room_version: room_version.to_string(),
                latest: LatestEvents::default(),
            },
        );
        Ok(nid)
    }

    fn select_room_nid(&self, room_id: &str) -> StorageResult<Option<RoomNid>> {
        self.ctx.check()?;
        Ok(self.room_nid_of(&self.shared.tables.read(), room_id))
    }

    fn select_room_info(&self, room_id: &str) -> StorageResult<Option<RoomInfo>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        Ok(self
            .room_nid_of(&tables, room_id)
            .and_then(|nid| self.room(&tables, nid)))
    }

    fn select_room_version(&self, room_nid: RoomNid) -> StorageResult<String> {
        self.ctx.check()?;
        self.room(&self.shared.tables.read(), room_nid)
            .map(|room| room.room_version)
            .ok_or_else(|| StorageError::not_found(format!("{room_nid}")))
    }

    fn select_latest_event_nids(
        &self,
        room_nid: RoomNid,
    ) -> StorageResult<(Vec<EventNid>, StateSnapshotNid)> {
        self.ctx.check()?;
        let latest = self.latest(room_nid)?;
        Ok((latest.latest_event_nids, latest.state_snapshot_nid))
    }

    fn select_latest_events_for_update(
        &mut self,
        room_nid: RoomNid,
    ) -> StorageResult<LatestEvents> {
        self.ctx.check()?;
        self.lock_row(RowKey::Room(room_nid))?;
        self.latest(room_nid)
    }

    fn update_latest_event_nids(
        &mut self,
        room_nid: RoomNid,
        latest: &LatestEvents,
    ) -> StorageResult<()> {
        self.ctx.check()?;
        self.latest(room_nid)?;
        self.lock_row(RowKey::Room(room_nid))?;
        self.overlay.rooms.insert(room_nid, latest.clone());
        Ok(())
    }
}

impl NidTable for MemTxn<'_> {
    fn insert_nid(&mut self, kind: NidKind, id: &str) -> StorageResult<i64> {
        self.ctx.check()?;
        Ok(self.shared.tables.write().nids_mut(kind).get_or_insert(id))
    }

    fn select_nid(&self, kind: NidKind, id: &str) -> StorageResult<Option<i64>> {
        self.ctx.check()?;
        Ok(self.shared.tables.read().nids(kind).by_id.get(id).copied())
    }

    fn bulk_select_nids(
        &self,
        kind: NidKind,
        ids: &[String],
    ) -> StorageResult<HashMap<String, i64>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let map = tables.nids(kind);
        Ok(ids
            .iter()
            .filter_map(|id| map.by_id.get(id).map(|nid| (id.clone(), *nid)))
            .collect())
    }

    fn bulk_select_strings(
        &self,
        kind: NidKind,
        nids: &[i64],
    ) -> StorageResult<HashMap<i64, String>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let map = tables.nids(kind);
        Ok(nids
            .iter()
            .filter_map(|nid| map.by_nid.get(nid).map(|id| (*nid, id.clone())))
            .collect())
    }
}

impl EventsTable for MemTxn<'_> {
    fn insert_event(&mut self, event: &NewEvent) -> StorageResult<(EventNid, bool)> {
        self.ctx.check()?;
        if let Some(nid) = self.event_nid(&self.shared.tables.read(), &event.event_id) {
            return Ok((nid, false));
        }
        let nid = EventNid(self.shared.next_event_nid.fetch_add(1, Ordering::SeqCst));
        self.overlay
            .event_ids
            .insert(event.event_id.clone(), nid);
        self.overlay.events.insert(nid, EventRow::from_new(nid, event));
        Ok((nid, true))
    }

    fn select_event_nid(&self, event_id: &str) -> StorageResult<Option<EventNid>> {
        self.ctx.check()?;
        Ok(self.event_nid(&self.shared.tables.read(), event_id))
    }

    fn bulk_select_event_nids(
        &self,
        event_ids: &[String],
    ) -> StorageResult<HashMap<String, EventNid>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        Ok(event_ids
            .iter()
            .filter_map(|id| self.event_nid(&tables, id).map(|nid| (id.clone(), nid)))
            .collect())
    }

    fn bulk_select_events(&self, event_nids: &[EventNid]) -> StorageResult<Vec<EventRow>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let nids: BTreeSet<EventNid> = event_nids.iter().copied().collect();
        Ok(nids
            .into_iter()
            .filter_map(|nid| self.event_by_nid(&tables, nid))
            .collect())
    }

    fn bulk_select_events_by_id(&self, event_ids: &[String]) -> StorageResult<Vec<EventRow>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let nids: BTreeSet<EventNid> = event_ids
            .iter()
            .filter_map(|id| self.event_nid(&tables, id))
            .collect();
        Ok(nids
            .into_iter()
            .filter_map(|nid| self.event_by_nid(&tables, nid))
            .collect())
    }
}

impl PreviousEventsTable for MemTxn<'_> {
    fn insert_previous_event(
        &mut self,
        previous_event_id: &str,
        event_nid: EventNid,
    ) -> StorageResult<()> {
        self.ctx.check()?;
        self.overlay
            .previous
            .push((previous_event_id.to_string(), event_nid));
        self.overlay
            .previous_ids
            .insert(previous_event_id.to_string());
        Ok(())
    }

    fn select_previous_event_exists(&self, event_id: &str) -> StorageResult<bool> {
        self.ctx.check()?;
        Ok(self.overlay.previous_ids.contains(event_id)
            || self.shared.tables.read().previous.contains_key(event_id))
    }
}

impl StateBlocksTable for MemTxn<'_> {
    fn insert_state_block(&mut self, entries: &[StateEntry]) -> StorageResult<StateBlockNid> {
        self.ctx.check()?;
        let entries = normalize_entries(entries);
        let hash = state_block_hash(&entries);
        if let Some(nid) = self.overlay.block_hashes.get(&hash) {
            return Ok(*nid);
        }
        if let Some(nid) = self.shared.tables.read().block_hashes.get(&hash) {
            return Ok(*nid);
        }
        let nid = StateBlockNid(self.shared.next_block_nid.fetch_add(1, Ordering::SeqCst));
        self.overlay.block_hashes.insert(hash, nid);
        self.overlay.blocks.insert(nid, entries);
        Ok(nid)
    }

    fn bulk_select_state_block_entries(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<Vec<StateEntryList>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let nids: BTreeSet<StateBlockNid> = state_block_nids.iter().copied().collect();
        nids.into_iter()
            .map(|nid| {
                self.overlay
                    .blocks
                    .get(&nid)
                    .or_else(|| tables.blocks.get(&nid))
                    .map(|entries| StateEntryList {
                        state_block_nid: nid,
                        entries: entries.clone(),
                    })
                    .ok_or_else(|| StorageError::not_found(format!("{nid}")))
            })
            .collect()
    }
}

impl StateSnapshotsTable for MemTxn<'_> {
    fn insert_state_snapshot(
        &mut self,
        room_nid: RoomNid,
        state_block_nids: &[StateBlockNid],
    ) -> StorageResult<StateSnapshotNid> {
        self.ctx.check()?;
        self.latest(room_nid)?;
        let nid = StateSnapshotNid(
            self.shared
                .next_snapshot_nid
                .fetch_add(1, Ordering::SeqCst),
        );
        self.overlay
            .snapshots
            .insert(nid, state_block_nids.to_vec());
        Ok(nid)
    }

    fn bulk_select_state_block_nids(
        &self,
        state_snapshot_nids: &[StateSnapshotNid],
    ) -> StorageResult<Vec<StateBlockNidList>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let nids: BTreeSet<StateSnapshotNid> = state_snapshot_nids.iter().copied().collect();
        nids.into_iter()
            .map(|nid| {
                self.overlay
                    .snapshots
                    .get(&nid)
                    .or_else(|| tables.snapshots.get(&nid))
                    .map(|blocks| StateBlockNidList {
                        state_snapshot_nid: nid,
                        state_block_nids: blocks.clone(),
                    })
                    .ok_or_else(|| StorageError::not_found(format!("{nid}")))
            })
            .collect()
    }
}

impl OutputRoomEventsTable for MemTxn<'_> {
    fn insert_output_event(&mut self, row: &OutputEventRow) -> StorageResult<()> {
        self.ctx.check()?;
        let taken = {
            let tables = self.shared.tables.read();
            self.output_position(&tables, &row.event_id).is_some()
                || tables.output.contains_key(&row.position)
                || self.overlay.output.contains_key(&row.position)
        };
        if taken {
            return Err(StorageError::conflict(format!(
                "output row for {} or {} already exists",
                row.event_id, row.position
            )));
        }
        self.overlay
            .output_ids
            .insert(row.event_id.clone(), row.position);
        self.overlay.output.insert(row.position, row.clone());
        Ok(())
    }

    fn update_exclude_from_sync(&mut self, event_id: &str, exclude: bool) -> StorageResult<()> {
        self.ctx.check()?;
        if let Some(position) = self.overlay.output_ids.get(event_id) {
            if let Some(row) = self.overlay.output.get_mut(position) {
                row.exclude_from_sync = exclude;
            }
            return Ok(());
        }
        if !self.shared.tables.read().output_ids.contains_key(event_id) {
            return Err(StorageError::not_found(format!("output row for {event_id}")));
        }
        self.overlay
            .exclude_updates
            .insert(event_id.to_string(), exclude);
        Ok(())
    }

    fn select_output_position(&self, event_id: &str) -> StorageResult<Option<StreamPosition>> {
        self.ctx.check()?;
        Ok(self.output_position(&self.shared.tables.read(), event_id))
    }

    fn select_output_events(
        &self,
        query: &OutputEventsQuery<'_>,
    ) -> StorageResult<Vec<OutputEventRow>> {
        self.ctx.check()?;
        if query.low >= query.high || query.limit == 0 {
            return Ok(Vec::new());
        }
        let tables = self.shared.tables.read();
        let bounds = (Bound::Excluded(query.low), Bound::Included(query.high));
        let mut positions: Vec<StreamPosition> = tables
            .output_rooms
            .get(query.room_id)
            .map(|set| set.range(bounds).copied().collect())
            .unwrap_or_default();
        positions.extend(
            self.overlay
                .output
                .range(bounds)
                .filter(|(_, row)| row.room_id == query.room_id)
                .map(|(position, _)| *position),
        );
        positions.sort_unstable();
        if query.order == ScanOrder::Descending {
            positions.reverse();
        }

        let mut rows = Vec::with_capacity(query.limit.min(positions.len()));
        for position in positions {
            if rows.len() >= query.limit {
                break;
            }
            let Some(row) = self.output_row(&tables, position) else {
                continue;
            };
            if query.only_sync_visible && row.exclude_from_sync {
                continue;
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn select_state_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
        limit: usize,
    ) -> StorageResult<Vec<OutputEventRow>> {
        self.ctx.check()?;
        if low >= high || limit == 0 {
            return Ok(Vec::new());
        }
        let tables = self.shared.tables.read();
        let bounds = (Bound::Excluded(low), Bound::Included(high));
        let mut positions: Vec<StreamPosition> = tables
            .output
            .range(bounds)
            .chain(self.overlay.output.range(bounds))
            .filter(|(_, row)| row.carries_state())
            .map(|(position, _)| *position)
            .collect();
        positions.sort_unstable();
        positions.truncate(limit);
        Ok(positions
            .into_iter()
            .filter_map(|position| self.output_row(&tables, position))
            .collect())
    }

    fn select_room_ids_in_range(
        &self,
        low: StreamPosition,
        high: StreamPosition,
    ) -> StorageResult<Vec<String>> {
        self.ctx.check()?;
        if low >= high {
            return Ok(Vec::new());
        }
        let tables = self.shared.tables.read();
        let bounds = (Bound::Excluded(low), Bound::Included(high));
        let rooms: BTreeSet<String> = tables
            .output
            .range(bounds)
            .chain(self.overlay.output.range(bounds))
            .filter(|(_, row)| !row.exclude_from_sync)
            .map(|(_, row)| row.room_id.clone())
            .collect();
        Ok(rooms.into_iter().collect())
    }

    fn select_output_events_by_id(
        &self,
        event_ids: &[String],
    ) -> StorageResult<Vec<OutputEventRow>> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let positions: BTreeSet<StreamPosition> = event_ids
            .iter()
            .filter_map(|id| self.output_position(&tables, id))
            .collect();
        Ok(positions
            .into_iter()
            .filter_map(|position| self.output_row(&tables, position))
            .collect())
    }

    fn select_max_position(&self) -> StorageResult<StreamPosition> {
        self.ctx.check()?;
        let tables = self.shared.tables.read();
        let committed = tables.output.keys().next_back().copied();
        let pending = self.overlay.output.keys().next_back().copied();
        Ok(committed.max(pending).unwrap_or(StreamPosition::ZERO))
    }
}

impl StreamIdTable for MemTxn<'_> {
    fn next_stream_position(&mut self, stream: &str) -> StorageResult<StreamPosition> {
        self.ctx.check()?;
        self.lock_row(RowKey::Stream(stream.to_string()))?;
        let current = self.select_stream_position(stream)?;
        let next = current.next();
        self.overlay.streams.insert(stream.to_string(), next.0);
        Ok(next)
    }

    fn select_stream_position(&self, stream: &str) -> StorageResult<StreamPosition> {
        self.ctx.check()?;
        if let Some(value) = self.overlay.streams.get(stream) {
            return Ok(StreamPosition(*value));
        }
        Ok(StreamPosition(
            self.shared
                .tables
                .read()
                .streams
                .get(stream)
                .copied()
                .unwrap_or(0),
        ))
    }
}
