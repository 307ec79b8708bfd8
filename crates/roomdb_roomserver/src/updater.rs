//! The transactional unit that applies one event to a room.
//!
//! Each call runs in its own transaction. The room row is locked before the
//! latest events are read, so writers of one room queue behind each other
//! while writers of different rooms proceed in parallel. Any error drops the
//! transaction, which rolls everything back.
//!
//! Outputs of one room are published in commit order. A per-room publish
//! guard is taken while the room row is still locked and held until the
//! output is handed to the producer.

use crate::config::RoomServerConfig;
use crate::error::{RoomServerError, RoomServerResult};
use crate::event_store::{EventStore, PrevEvents, StoredEvent};
use crate::nid::NidAllocator;
use crate::output::OutputProducer;
use crate::state_resolution::StateResolver;
use crate::state_store::{state_diff, StateStore};
use crate::types::{InputKind, InputRoomEvent, OutputNewRoomEvent, RoomUpdate, StateMap};
use roomdb_event::HeaderedEvent;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use roomdb_storage::{
    Context, EventNid, LatestEvents, RoomNid, StateSnapshotNid, Store, Txn,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Applies input events to rooms.
#[derive(Clone)]
pub struct RoomUpdater {
    store: Arc<dyn Store>,
    config: RoomServerConfig,
    producer: Option<Arc<dyn OutputProducer>>,
    publishing: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl fmt::Debug for RoomUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomUpdater")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("producer", &self.producer.is_some())
            .finish()
    }
}

impl RoomUpdater {
    /// Creates an updater over `store`.
    pub fn new(store: Arc<dyn Store>, config: RoomServerConfig) -> Self {
        Self {
            store,
            config,
            producer: None,
            publishing: Arc::default(),
        }
    }

    /// Publishes every applied event to `producer` once it is committed.
    #[must_use]
    pub fn with_producer(mut self, producer: Arc<dyn OutputProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RoomServerConfig {
        &self.config
    }

    /// Stores one event and advances its room.
    ///
    /// Nothing is written unless the result is [`RoomUpdate::Applied`]. A
    /// retryable error means the transaction lost a race and the call can be
    /// repeated as is.
    #[instrument(
        skip_all,
        fields(event_id = %input.event.event_id(), room_id = %input.event.room_id(), kind = ?input.kind)
    )]
    pub fn process(&self, ctx: &Context, input: &InputRoomEvent) -> RoomServerResult<RoomUpdate> {
        let ctx = ctx.child_with_timeout(self.config.lock_timeout_duration());
        let mut txn = self.store.begin(&ctx)?;
        let update = apply(&mut *txn, &self.config, input)?;

        match &update {
            RoomUpdate::Applied(output) => {
                let _publishing = self
                    .producer
                    .as_ref()
                    .map(|_| self.publish_guard(output.event.room_id()));
                txn.commit()?;
                info!(
                    latest = output.latest_event_ids.len(),
                    added = output.adds_state_event_ids.len(),
                    removed = output.removes_state_event_ids.len(),
                    "event applied"
                );
                if let Some(producer) = &self.producer {
                    producer.publish(output.clone());
                }
            }
            RoomUpdate::AlreadyExists { event_nid } => {
                txn.rollback()?;
                debug!(%event_nid, "event already stored");
            }
            RoomUpdate::MissingPrevEvents { missing } => {
                txn.rollback()?;
                debug!(missing = missing.len(), "prev events unknown");
            }
        }
        Ok(update)
    }

    /// Serializes commit and publish for one room.
    fn publish_guard(&self, room_id: &str) -> ArcMutexGuard<RawMutex, ()> {
        let slot = {
            let mut rooms = self.publishing.lock();
            Arc::clone(rooms.entry(room_id.to_string()).or_default())
        };
        slot.lock_arc()
    }
}

fn apply(
    txn: &mut dyn Txn,
    config: &RoomServerConfig,
    input: &InputRoomEvent,
) -> RoomServerResult<RoomUpdate> {
    let event = HeaderedEvent::new(input.event.room_version, input.event.event.clone())?;
    if let Some(event_nid) = txn.select_event_nid(event.event_id())? {
        return Ok(RoomUpdate::AlreadyExists { event_nid });
    }

    let room_nid = room_for(txn, &event, input.kind)?;
    let prevs = txn.prev_events_exist(&event.prev_events)?;
    if !prevs.all_exist() && input.state_event_ids.is_none() {
        return Ok(RoomUpdate::MissingPrevEvents {
            missing: prevs.missing,
        });
    }

    let resolver = StateResolver::for_version(event.room_version);
    let state_before = match &input.state_event_ids {
        Some(ids) => supplied_state(txn, config, room_nid, &event, ids)?,
        None => derived_state(txn, config, &resolver, room_nid, &event, &prevs)?,
    };

    let (event_nid, inserted) =
        txn.insert_headered_event(room_nid, &event, &prevs.known, state_before)?;
    if !inserted {
        return Ok(RoomUpdate::AlreadyExists { event_nid });
    }

    let output = match input.kind {
        InputKind::Backfill => {
            let (latest, _) = txn.select_latest_event_nids(room_nid)?;
            OutputNewRoomEvent {
                event,
                latest_event_ids: txn.event_ids_for(&latest)?,
                last_sent_event_id: None,
                adds_state_event_ids: Vec::new(),
                removes_state_event_ids: Vec::new(),
                transaction_id: input.transaction_id.clone(),
                exclude_from_sync: true,
            }
        }
        InputKind::New => {
            let stored = StoredEvent {
                event_nid,
                room_nid,
                state_key: None,
                state_before,
                prev_event_nids: prevs.known.clone(),
                event,
            };
            advance_room(txn, config, &resolver, stored, &prevs, input)?
        }
    };
    Ok(RoomUpdate::Applied(output))
}

/// Resolves the room of an event, creating it for `m.room.create`.
fn room_for(txn: &mut dyn Txn, event: &HeaderedEvent, kind: InputKind) -> RoomServerResult<RoomNid> {
    let version = event.room_version.as_str();
    let mismatch = |stored: String| RoomServerError::RoomVersionMismatch {
        room_id: event.room_id().to_string(),
        stored,
        claimed: version.to_string(),
    };

    if event.is_create() {
        let room_nid = txn.room_nid(event.room_id(), version)?;
        let stored = txn.select_room_version(room_nid)?;
        if stored != version {
            return Err(mismatch(stored));
        }
        let (latest, _) = txn.select_latest_event_nids(room_nid)?;
        if kind == InputKind::New && !latest.is_empty() {
            return Err(RoomServerError::invalid(
                event.event_id(),
                "room already has a create event",
            ));
        }
        return Ok(room_nid);
    }

    let info = txn
        .select_room_info(event.room_id())?
        .ok_or_else(|| RoomServerError::UnknownRoom {
            room_id: event.room_id().to_string(),
        })?;
    if info.room_version != version {
        return Err(mismatch(info.room_version));
    }
    Ok(info.room_nid)
}

/// Stores the caller-supplied state before an event.
fn supplied_state(
    txn: &mut dyn Txn,
    config: &RoomServerConfig,
    room_nid: RoomNid,
    event: &HeaderedEvent,
    state_event_ids: &[String],
) -> RoomServerResult<StateSnapshotNid> {
    let wanted: BTreeSet<&str> = state_event_ids.iter().map(String::as_str).collect();
    let stored = txn.events_by_id(state_event_ids)?;
    if stored.len() != wanted.len() {
        return Err(RoomServerError::invalid(
            event.event_id(),
            format!(
                "{} of {} supplied state events are unknown",
                wanted.len() - stored.len(),
                wanted.len()
            ),
        ));
    }

    let mut state = StateMap::new();
    for state_event in &stored {
        if state_event.room_nid != room_nid {
            return Err(RoomServerError::invalid(
                event.event_id(),
                format!("state event {} belongs to another room", state_event.event_id()),
            ));
        }
        let entry = state_event.state_entry().ok_or_else(|| {
            RoomServerError::invalid(
                event.event_id(),
                format!("{} is not a state event", state_event.event_id()),
            )
        })?;
        if let Some(previous) = state.insert(entry.key, entry.event_nid) {
            return Err(RoomServerError::invalid(
                event.event_id(),
                format!("supplied state has two events for one slot ({previous})"),
            ));
        }
    }

    let (_, base) = txn.select_latest_event_nids(room_nid)?;
    txn.store_state(room_nid, base, &state, config.max_state_blocks_per_snapshot)
}

/// Computes the state before an event from its prev events.
fn derived_state(
    txn: &mut dyn Txn,
    config: &RoomServerConfig,
    resolver: &StateResolver,
    room_nid: RoomNid,
    event: &HeaderedEvent,
    prevs: &PrevEvents,
) -> RoomServerResult<StateSnapshotNid> {
    if event.is_create() {
        return Ok(StateSnapshotNid::EMPTY);
    }
    let max_blocks = config.max_state_blocks_per_snapshot;
    let prev_events = txn.events_by_nid(&prevs.known)?;
    if let Some(foreign) = prev_events.iter().find(|p| p.room_nid != room_nid) {
        return Err(RoomServerError::invalid(
            event.event_id(),
            format!("prev event {} belongs to another room", foreign.event_id()),
        ));
    }

    match prev_events.as_slice() {
        [] => Err(RoomServerError::Inconsistent(format!(
            "no prev events of {} are stored",
            event.event_id()
        ))),
        [prev] => {
            let (latest, snapshot) = txn.select_latest_event_nids(room_nid)?;
            if latest == [prev.event_nid] {
                return Ok(snapshot);
            }
            match prev.state_entry() {
                Some(entry) => txn.append_block(room_nid, prev.state_before, &[entry], max_blocks),
                None => Ok(prev.state_before),
            }
        }
        several => {
            let states = several
                .iter()
                .map(|p| txn.state_after_event(p))
                .collect::<RoomServerResult<Vec<_>>>()?;
            let resolved = resolver.resolve_in(&*txn, &states)?;
            let (_, base) = txn.select_latest_event_nids(room_nid)?;
            txn.store_state(room_nid, base, &resolved, max_blocks)
        }
    }
}

/// Moves the room's latest events and state past a newly stored event.
fn advance_room(
    txn: &mut dyn Txn,
    config: &RoomServerConfig,
    resolver: &StateResolver,
    mut event: StoredEvent,
    prevs: &PrevEvents,
    input: &InputRoomEvent,
) -> RoomServerResult<OutputNewRoomEvent> {
    let max_blocks = config.max_state_blocks_per_snapshot;
    let old = txn.select_latest_events_for_update(event.room_nid)?;
    let referenced = txn.select_previous_event_exists(event.event_id())?;

    let mut latest: Vec<EventNid> = old
        .latest_event_nids
        .iter()
        .copied()
        .filter(|nid| !prevs.known.contains(nid))
        .collect();
    if !referenced {
        latest.push(event.event_nid);
    }
    latest.sort_unstable();
    latest.dedup();

    if let Some(tuple) = event.event.state_key_tuple() {
        event.state_key = Some(txn.state_key_nids(&tuple)?);
    }

    let snapshot = if latest == old.latest_event_nids {
        old.state_snapshot_nid
    } else if latest == [event.event_nid] {
        match event.state_entry() {
            Some(entry) => txn.append_block(event.room_nid, event.state_before, &[entry], max_blocks)?,
            None => event.state_before,
        }
    } else {
        let heads = txn.events_by_nid(&latest)?;
        if heads.len() != latest.len() {
            return Err(RoomServerError::Inconsistent(format!(
                "room has {} latest events, {} stored",
                latest.len(),
                heads.len()
            )));
        }
        let states = heads
            .iter()
            .map(|head| txn.state_after_event(head))
            .collect::<RoomServerResult<Vec<_>>>()?;
        let resolved = resolver.resolve_in(&*txn, &states)?;
        txn.store_state(event.room_nid, old.state_snapshot_nid, &resolved, max_blocks)?
    };

    let (removes, adds) = if snapshot == old.state_snapshot_nid {
        (Vec::new(), Vec::new())
    } else {
        let before = txn.load_snapshot(old.state_snapshot_nid)?;
        let after = txn.load_snapshot(snapshot)?;
        let delta = state_diff(&before, &after);
        let removed: Vec<EventNid> = delta.removed.iter().map(|e| e.event_nid).collect();
        let added: Vec<EventNid> = delta.added.iter().map(|e| e.event_nid).collect();
        (txn.event_ids_for(&removed)?, txn.event_ids_for(&added)?)
    };

    let last_sent_event_id = if old.last_event_sent_nid == EventNid::NONE {
        None
    } else {
        txn.event_ids_for(&[old.last_event_sent_nid])?.pop()
    };

    txn.update_latest_event_nids(
        event.room_nid,
        &LatestEvents {
            latest_event_nids: latest.clone(),
            last_event_sent_nid: event.event_nid,
            state_snapshot_nid: snapshot,
        },
    )?;
    debug!(
        latest = ?latest,
        %snapshot,
        forked = latest.len() > 1,
        "room advanced"
    );

    Ok(OutputNewRoomEvent {
        latest_event_ids: txn.event_ids_for(&latest)?,
        last_sent_event_id,
        adds_state_event_ids: adds,
        removes_state_event_ids: removes,
        transaction_id: input.transaction_id.clone(),
        exclude_from_sync: false,
        event: event.event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdb_event::{Event, RoomVersion};
    use roomdb_storage::MemoryStore;
    use serde_json::json;

    fn event(id: &str, event_type: &str, state_key: Option<&str>, prev: &[&str]) -> HeaderedEvent {
        HeaderedEvent::new(
            RoomVersion::V1,
            Event {
                event_id: id.to_string(),
                room_id: "!r:x".into(),
                sender: "@alice:x".into(),
                event_type: event_type.into(),
                state_key: state_key.map(str::to_string),
                prev_events: prev.iter().map(|p| p.to_string()).collect(),
                auth_events: vec![],
                depth: prev.len() as i64,
                origin_server_ts: 0,
                content: json!({"creator": "@alice:x", "membership": "join", "body": id}),
            },
        )
        .unwrap()
    }

    fn updater() -> RoomUpdater {
        RoomUpdater::new(Arc::new(MemoryStore::new()), RoomServerConfig::default())
    }

    #[test]
    fn create_then_message() {
        let updater = updater();
        let ctx = Context::background();

        let created = updater
            .process(&ctx, &InputRoomEvent::new(event("$c:x", "m.room.create", Some(""), &[])))
            .unwrap();
        let created = created.applied().unwrap();
        assert_eq!(created.latest_event_ids, vec!["$c:x"]);
        assert_eq!(created.adds_state_event_ids, vec!["$c:x"]);
        assert_eq!(created.last_sent_event_id, None);

        let msg = updater
            .process(&ctx, &InputRoomEvent::new(event("$m:x", "m.room.message", None, &["$c:x"])))
            .unwrap();
        let msg = msg.applied().unwrap();
        assert_eq!(msg.latest_event_ids, vec!["$m:x"]);
        assert!(!msg.changes_state());
        assert_eq!(msg.last_sent_event_id.as_deref(), Some("$c:x"));
    }

    #[test]
    fn unknown_room_is_rejected() {
        let err = updater()
            .process(
                &Context::background(),
                &InputRoomEvent::new(event("$m:x", "m.room.message", None, &["$c:x"])),
            )
            .unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn second_create_is_rejected() {
        let updater = updater();
        let ctx = Context::background();
        updater
            .process(&ctx, &InputRoomEvent::new(event("$c:x", "m.room.create", Some(""), &[])))
            .unwrap();
        let err = updater
            .process(&ctx, &InputRoomEvent::new(event("$c2:x", "m.room.create", Some(""), &[])))
            .unwrap_err();
        assert!(matches!(err, RoomServerError::InvalidEvent { .. }));
    }

    #[test]
    fn cancelled_context_writes_nothing() {
        let updater = updater();
        let ctx = Context::background();
        ctx.cancel();
        let err = updater
            .process(&ctx, &InputRoomEvent::new(event("$c:x", "m.room.create", Some(""), &[])))
            .unwrap_err();
        assert_eq!(err.kind(), roomdb_storage::ErrorKind::Cancelled);
    }
}
