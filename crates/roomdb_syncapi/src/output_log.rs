//! The output log: every applied event at a unique stream position.
//!
//! Positions come from the `global` counter row, which every append locks
//! until commit. That serializes appends across rooms and gives the log a
//! total order with no gaps visible to readers.

use crate::error::{SyncError, SyncResult};
use crate::types::{Range, StateInRange, StreamEvent};
use roomdb_event::HeaderedEvent;
use roomdb_roomserver::{OutputNewRoomEvent, TransactionId};
use roomdb_storage::{
    Context, OutputEventRow, OutputEventsQuery, ScanOrder, Store, StreamPosition, Txn,
    GLOBAL_STREAM,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Appends to and reads from the output log.
#[derive(Clone)]
pub struct OutputLog {
    store: Arc<dyn Store>,
}

impl fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputLog")
            .field("engine", &self.store.engine())
            .finish()
    }
}

impl OutputLog {
    /// Creates a log over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Appends an event and returns its position.
    ///
    /// Appending an event ID that is already logged keeps its original
    /// position and only rewrites the exclude flag.
    #[instrument(skip_all, fields(event_id = %event.event_id(), exclude = exclude_from_sync))]
    pub fn append_event(
        &self,
        ctx: &Context,
        event: &HeaderedEvent,
        add_state_ids: &[String],
        remove_state_ids: &[String],
        transaction_id: Option<&TransactionId>,
        exclude_from_sync: bool,
    ) -> SyncResult<StreamPosition> {
        let mut txn = self.store.begin(ctx)?;
        if let Some(position) = txn.select_output_position(event.event_id())? {
            txn.update_exclude_from_sync(event.event_id(), exclude_from_sync)?;
            txn.commit()?;
            debug!(%position, "event already logged");
            return Ok(position);
        }

        let position = txn.next_stream_position(GLOBAL_STREAM)?;
        // A concurrent append of the same event may have committed while we
        // waited for the counter lock.
        if let Some(existing) = txn.select_output_position(event.event_id())? {
            txn.update_exclude_from_sync(event.event_id(), exclude_from_sync)?;
            txn.commit()?;
            return Ok(existing);
        }

        let row = OutputEventRow {
            position,
            room_id: event.room_id.clone(),
            event_id: event.event_id().to_string(),
            event_json: event.to_json()?,
            event_type: event.event_type.clone(),
            sender: event.sender.clone(),
            contains_url: event.contains_url(),
            add_state_ids: non_empty(add_state_ids),
            remove_state_ids: non_empty(remove_state_ids),
            session_id: transaction_id.map(|t| t.session_id),
            transaction_id: transaction_id.map(|t| t.transaction_id.clone()),
            exclude_from_sync,
        };
        txn.insert_output_event(&row)?;
        txn.commit()?;
        debug!(%position, "event logged");
        Ok(position)
    }

    /// Appends a room server output.
    pub fn append_output(
        &self,
        ctx: &Context,
        output: &OutputNewRoomEvent,
    ) -> SyncResult<StreamPosition> {
        self.append_event(
            ctx,
            &output.event,
            &output.adds_state_event_ids,
            &output.removes_state_event_ids,
            output.transaction_id.as_ref(),
            output.exclude_from_sync,
        )
    }

    /// The newest `limit` events of a room in `range`.
    ///
    /// Returned oldest first when `chronological` is set, newest first
    /// otherwise.
    pub fn select_recent_events(
        &self,
        ctx: &Context,
        room_id: &str,
        range: Range,
        limit: usize,
        chronological: bool,
        only_sync_visible: bool,
    ) -> SyncResult<Vec<StreamEvent>> {
        let query = OutputEventsQuery {
            room_id,
            low: range.low(),
            high: range.high(),
            limit,
            order: ScanOrder::Descending,
            only_sync_visible,
        };
        let mut events = self.read(ctx, |txn| decode_rows(txn.select_output_events(&query)?))?;
        if chronological {
            events.reverse();
        }
        Ok(events)
    }

    /// The oldest `limit` events of a room in `range`, oldest first.
    ///
    /// With `only_sync_visible` unset, backfilled rows are returned too.
    pub fn select_early_events(
        &self,
        ctx: &Context,
        room_id: &str,
        range: Range,
        limit: usize,
        only_sync_visible: bool,
    ) -> SyncResult<Vec<StreamEvent>> {
        let query = OutputEventsQuery {
            room_id,
            low: range.low(),
            high: range.high(),
            limit,
            order: ScanOrder::Ascending,
            only_sync_visible,
        };
        self.read(ctx, |txn| decode_rows(txn.select_output_events(&query)?))
    }

    /// Folds the state changes logged in `range` into the state each room
    /// still needs.
    ///
    /// Later rows override earlier ones for the same event ID. An ID whose
    /// last word is a removal is dropped from the needed set.
    #[instrument(skip(self, ctx), fields(low = %range.low(), high = %range.high()))]
    pub fn select_state_in_range(
        &self,
        ctx: &Context,
        range: Range,
        limit: usize,
    ) -> SyncResult<StateInRange> {
        let rows = self.read(ctx, |txn| {
            Ok(txn.select_state_in_range(range.low(), range.high(), limit)?)
        })?;

        let mut in_state: HashMap<String, HashMap<String, bool>> = HashMap::new();
        let mut events = HashMap::with_capacity(rows.len());
        for row in rows {
            let adds = row.add_state_ids.as_deref().unwrap_or_default();
            let removes = row.remove_state_ids.as_deref().unwrap_or_default();
            if removes.len() > adds.len() {
                warn!(
                    event_id = %row.event_id,
                    added = adds.len(),
                    removed = removes.len(),
                    "state deletion is not sent to clients"
                );
            }

            let room = in_state.entry(row.room_id.clone()).or_default();
            for id in removes {
                room.insert(id.clone(), false);
            }
            for id in adds {
                room.insert(id.clone(), true);
            }
            let event = decode_row(row)?;
            events.insert(event.event.event_id().to_string(), event);
        }

        let needed = in_state
            .into_iter()
            .map(|(room_id, ids)| {
                let ids: BTreeSet<String> = ids
                    .into_iter()
                    .filter_map(|(id, present)| present.then_some(id))
                    .collect();
                (room_id, ids)
            })
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        Ok(StateInRange { needed, events })
    }

    /// Rooms with a sync-visible event in `range`, sorted.
    pub fn select_rooms_in_range(&self, ctx: &Context, range: Range) -> SyncResult<Vec<String>> {
        self.read(ctx, |txn| {
            Ok(txn.select_room_ids_in_range(range.low(), range.high())?)
        })
    }

    /// The highest position in the log, zero when empty.
    pub fn select_max_event_id(&self, ctx: &Context) -> SyncResult<StreamPosition> {
        self.read(ctx, |txn| Ok(txn.select_max_position()?))
    }

    /// Logged events by ID, sorted by position. Unlogged IDs are omitted.
    pub fn select_events(&self, ctx: &Context, event_ids: &[String]) -> SyncResult<Vec<StreamEvent>> {
        self.read(ctx, |txn| {
            decode_rows(txn.select_output_events_by_id(event_ids)?)
        })
    }

    fn read<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&dyn Txn) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let txn = self.store.begin(ctx)?;
        let out = f(&*txn)?;
        txn.rollback()?;
        Ok(out)
    }
}

fn non_empty(ids: &[String]) -> Option<Vec<String>> {
    (!ids.is_empty()).then(|| ids.to_vec())
}

fn decode_rows(rows: Vec<OutputEventRow>) -> SyncResult<Vec<StreamEvent>> {
    rows.into_iter().map(decode_row).collect()
}

fn decode_row(row: OutputEventRow) -> SyncResult<StreamEvent> {
    let event = HeaderedEvent::from_json(&row.event_json).map_err(|e| SyncError::CorruptRow {
        event_id: row.event_id.clone(),
        detail: e.to_string(),
    })?;
    let transaction_id = match (row.session_id, row.transaction_id) {
        (Some(session_id), Some(transaction_id)) => Some(TransactionId {
            session_id,
            transaction_id,
        }),
        _ => None,
    };
    Ok(StreamEvent {
        position: row.position,
        event,
        transaction_id,
        exclude_from_sync: row.exclude_from_sync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdb_event::{Event, RoomVersion};
    use roomdb_storage::MemoryStore;
    use serde_json::json;

    fn event(id: &str, event_type: &str, state_key: Option<&str>) -> HeaderedEvent {
        HeaderedEvent::new(
            RoomVersion::V1,
            Event {
                event_id: id.to_string(),
                room_id: "!r:test".into(),
                sender: "@alice:test".into(),
                event_type: event_type.into(),
                state_key: state_key.map(str::to_string),
                prev_events: vec!["$0:test".into()],
                auth_events: vec![],
                depth: 2,
                origin_server_ts: 0,
                content: json!({"body": id}),
            },
        )
        .unwrap()
    }

    fn log() -> OutputLog {
        OutputLog::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn positions_increase_without_gaps() {
        let log = log();
        let ctx = Context::background();
        for i in 1..=5 {
            let e = event(&format!("${i}:test"), "m.room.message", None);
            let position = log.append_event(&ctx, &e, &[], &[], None, false).unwrap();
            assert_eq!(position, StreamPosition(i));
        }
        assert_eq!(log.select_max_event_id(&ctx).unwrap(), StreamPosition(5));
    }

    #[test]
    fn reappend_keeps_position_and_updates_flag() {
        let log = log();
        let ctx = Context::background();
        let e = event("$1:test", "m.room.message", None);
        let first = log.append_event(&ctx, &e, &[], &[], None, true).unwrap();
        let again = log.append_event(&ctx, &e, &[], &[], None, false).unwrap();
        assert_eq!(first, again);
        assert_eq!(log.select_max_event_id(&ctx).unwrap(), first);

        let stored = log.select_events(&ctx, &["$1:test".to_string()]).unwrap();
        assert!(!stored[0].exclude_from_sync);
    }

    #[test]
    fn transaction_id_needs_both_parts() {
        let log = log();
        let ctx = Context::background();
        let txn_id = TransactionId {
            session_id: 7,
            transaction_id: "t1".into(),
        };
        let e = event("$1:test", "m.room.message", None);
        log.append_event(&ctx, &e, &[], &[], Some(&txn_id), false)
            .unwrap();
        let stored = log.select_events(&ctx, &["$1:test".to_string()]).unwrap();
        assert_eq!(stored[0].transaction_id, Some(txn_id));
    }

    #[test]
    fn recent_and_early_scans() {
        let log = log();
        let ctx = Context::background();
        for i in 1..=6 {
            let e = event(&format!("${i}:test"), "m.room.message", None);
            log.append_event(&ctx, &e, &[], &[], None, i == 3).unwrap();
        }
        let all = Range::forward(StreamPosition::ZERO, StreamPosition(6));

        let recent = log
            .select_recent_events(&ctx, "!r:test", all, 2, true, true)
            .unwrap();
        let positions: Vec<i64> = recent.iter().map(|e| e.position.as_i64()).collect();
        assert_eq!(positions, vec![5, 6]);

        let newest_first = log
            .select_recent_events(&ctx, "!r:test", all, 3, false, true)
            .unwrap();
        let positions: Vec<i64> = newest_first.iter().map(|e| e.position.as_i64()).collect();
        assert_eq!(positions, vec![6, 5, 4]);

        let early = log.select_early_events(&ctx, "!r:test", all, 3, true).unwrap();
        let positions: Vec<i64> = early.iter().map(|e| e.position.as_i64()).collect();
        assert_eq!(positions, vec![1, 2, 4]);

        let with_backfill = log.select_early_events(&ctx, "!r:test", all, 3, false).unwrap();
        let positions: Vec<i64> = with_backfill.iter().map(|e| e.position.as_i64()).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn state_in_range_drops_net_removals() {
        let log = log();
        let ctx = Context::background();
        let a = event("$a:test", "m.room.name", Some(""));
        let b = event("$b:test", "m.room.name", Some(""));
        let c = event("$c:test", "m.room.topic", Some(""));
        log.append_event(&ctx, &a, &["$a:test".into()], &[], None, false)
            .unwrap();
        log.append_event(&ctx, &b, &["$b:test".into()], &["$a:test".into()], None, false)
            .unwrap();
        log.append_event(&ctx, &c, &["$c:test".into()], &[], None, false)
            .unwrap();

        let all = Range::forward(StreamPosition::ZERO, StreamPosition(3));
        let state = log.select_state_in_range(&ctx, all, 100).unwrap();
        let needed: Vec<&str> = state.needed["!r:test"].iter().map(String::as_str).collect();
        assert_eq!(needed, vec!["$b:test", "$c:test"]);
        assert_eq!(state.events.len(), 3);

        // Only the tail of the window.
        let tail = Range::forward(StreamPosition(1), StreamPosition(2));
        let state = log.select_state_in_range(&ctx, tail, 100).unwrap();
        let needed: Vec<&str> = state.needed["!r:test"].iter().map(String::as_str).collect();
        assert_eq!(needed, vec!["$b:test"]);
    }
}
