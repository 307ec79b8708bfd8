//! Read-only queries over room state.

use crate::error::{RoomServerError, RoomServerResult};
use crate::event_store::EventStore;
use crate::nid::NidAllocator;
use crate::state_resolution::StateResolver;
use crate::state_store::StateStore;
use crate::types::StateMap;
use roomdb_event::{HeaderedEvent, RoomVersion, StateKeyTuple, MEMBERSHIP_JOIN, M_ROOM_MEMBER};
use roomdb_storage::{Context, EventNid, Store, Txn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

/// The current extremities and state of a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestEventsAndState {
    /// False if no event of the room has been applied.
    pub room_exists: bool,
    /// Version the room was created with.
    pub room_version: Option<RoomVersion>,
    /// Forward extremities, sorted by NID.
    pub latest_event_ids: Vec<String>,
    /// Requested state events, sorted by NID.
    pub state_events: Vec<HeaderedEvent>,
}

/// The state a new event with the given prev events would see.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateAfterEvents {
    /// False if no event of the room has been applied.
    pub room_exists: bool,
    /// False if any prev event is unknown. No state is returned then.
    pub prev_events_exist: bool,
    /// Requested state events, sorted by NID.
    pub state_events: Vec<HeaderedEvent>,
}

/// Answers questions about rooms without writing.
#[derive(Clone)]
pub struct RoomQuery {
    store: Arc<dyn Store>,
}

impl fmt::Debug for RoomQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomQuery").field("store", &self.store).finish()
    }
}

impl RoomQuery {
    /// Creates a query handle over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the latest events of a room and its current state, limited
    /// to `tuples` unless that is empty.
    #[instrument(skip(self, ctx, tuples))]
    pub fn latest_events_and_state(
        &self,
        ctx: &Context,
        room_id: &str,
        tuples: &[StateKeyTuple],
    ) -> RoomServerResult<LatestEventsAndState> {
        self.read(ctx, |txn| {
            let Some(info) = txn.select_room_info(room_id)? else {
                return Ok(LatestEventsAndState::default());
            };
            if info.latest.latest_event_nids.is_empty() {
                return Ok(LatestEventsAndState::default());
            }
            let state = txn.load_snapshot(info.latest.state_snapshot_nid)?;
            Ok(LatestEventsAndState {
                room_exists: true,
                room_version: Some(info.room_version.parse()?),
                latest_event_ids: txn.event_ids_for(&info.latest.latest_event_nids)?,
                state_events: select_state(txn, &state, tuples)?,
            })
        })
    }

    /// Resolves the state after `prev_event_ids`, limited to `tuples` unless
    /// that is empty.
    #[instrument(skip(self, ctx, prev_event_ids, tuples))]
    pub fn state_after_events(
        &self,
        ctx: &Context,
        room_id: &str,
        prev_event_ids: &[String],
        tuples: &[StateKeyTuple],
    ) -> RoomServerResult<StateAfterEvents> {
        self.read(ctx, |txn| {
            let Some(info) = txn.select_room_info(room_id)? else {
                return Ok(StateAfterEvents::default());
            };
            if info.latest.latest_event_nids.is_empty() {
                return Ok(StateAfterEvents::default());
            }
            let prevs = txn.prev_events_exist(prev_event_ids)?;
            if !prevs.all_exist() {
                return Ok(StateAfterEvents {
                    room_exists: true,
                    prev_events_exist: false,
                    state_events: Vec::new(),
                });
            }

            let version: RoomVersion = info.room_version.parse()?;
            let states = txn
                .events_by_nid(&prevs.known)?
                .iter()
                .map(|prev| txn.state_after_event(prev))
                .collect::<RoomServerResult<Vec<_>>>()?;
            let state = StateResolver::for_version(version).resolve_in(txn, &states)?;
            Ok(StateAfterEvents {
                room_exists: true,
                prev_events_exist: true,
                state_events: select_state(txn, &state, tuples)?,
            })
        })
    }

    /// Loads events by ID. Unknown IDs are omitted.
    pub fn events_by_id(
        &self,
        ctx: &Context,
        event_ids: &[String],
    ) -> RoomServerResult<Vec<HeaderedEvent>> {
        self.read(ctx, |txn| {
            Ok(txn
                .events_by_id(event_ids)?
                .into_iter()
                .map(|stored| stored.event)
                .collect())
        })
    }

    /// Returns the version of a room, or `None` for unknown rooms.
    pub fn room_version(&self, ctx: &Context, room_id: &str) -> RoomServerResult<Option<RoomVersion>> {
        self.read(ctx, |txn| match txn.select_room_info(room_id)? {
            Some(info) => Ok(Some(info.room_version.parse()?)),
            None => Ok(None),
        })
    }

    /// Returns true if `user_id` was joined to the room in the state before
    /// `event_id`. Unknown events are not visible.
    #[instrument(skip(self, ctx))]
    pub fn is_event_visible_to(
        &self,
        ctx: &Context,
        user_id: &str,
        event_id: &str,
    ) -> RoomServerResult<bool> {
        self.read(ctx, |txn| {
            let Some(event) = txn.events_by_id(&[event_id.to_string()])?.pop() else {
                return Ok(false);
            };
            let state = txn.load_snapshot(event.state_before)?;
            let member = select_state(txn, &state, &[StateKeyTuple::new(M_ROOM_MEMBER, user_id)])?;
            Ok(member
                .first()
                .and_then(|m| m.membership())
                .map_or(false, |membership| membership == MEMBERSHIP_JOIN))
        })
    }

    /// Runs `f` in a transaction that is always rolled back.
    fn read<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&dyn Txn) -> RoomServerResult<T>,
    ) -> RoomServerResult<T> {
        let txn = self.store.begin(ctx)?;
        let out = f(&*txn)?;
        txn.rollback()?;
        Ok(out)
    }
}

/// Loads the events of `state` occupying `tuples`, or all of them when
/// `tuples` is empty.
fn select_state(
    txn: &dyn Txn,
    state: &StateMap,
    tuples: &[StateKeyTuple],
) -> RoomServerResult<Vec<HeaderedEvent>> {
    let mut nids: Vec<EventNid> = if tuples.is_empty() {
        state.values().copied().collect()
    } else {
        txn.lookup_state_keys(tuples)?
            .keys()
            .filter_map(|key| state.get(key).copied())
            .collect()
    };
    nids.sort_unstable();
    nids.dedup();

    let events = txn.events_by_nid(&nids)?;
    if events.len() != nids.len() {
        return Err(RoomServerError::Inconsistent(format!(
            "state references {} events, {} stored",
            nids.len(),
            events.len()
        )));
    }
    Ok(events.into_iter().map(|stored| stored.event).collect())
}
