//! Incremental sync assembly.
//!
//! A sync request names the position the client last saw. The response
//! covers `(since, current]`: for each room with activity, the most recent
//! timeline events plus the state that changed and is not already implied by
//! the timeline.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::notifier::Notifier;
use crate::output_log::OutputLog;
use crate::types::{Range, StreamEvent, SyncToken};
use roomdb_event::HeaderedEvent;
use roomdb_storage::{Context, StreamPosition};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// A client's incremental sync request.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Session of the requesting device. Own transaction IDs are echoed back.
    pub session_id: Option<i64>,
    /// Position the client has seen. `None` syncs from the start of the log.
    pub since: Option<SyncToken>,
    /// Timeline events per room. Clamped by [`SyncConfig::timeline_limit`].
    pub timeline_limit: Option<usize>,
    /// How long to wait for new events. `None` uses the configured default,
    /// zero returns at once.
    pub timeout: Option<Duration>,
    /// Rooms to include. Empty means every room.
    pub rooms: Vec<String>,
}

/// A timeline event as a client sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvent {
    /// The event.
    pub event: HeaderedEvent,
    /// Stream position.
    pub position: StreamPosition,
    /// Set only for the session that sent the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// Timeline section of a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timeline {
    /// Events, oldest first.
    pub events: Vec<ClientEvent>,
    /// True if older events in the window were left out.
    pub limited: bool,
    /// Token to paginate backwards from the oldest event returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<SyncToken>,
}

/// One room of a sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoomResponse {
    /// Recent events.
    pub timeline: Timeline,
    /// State that changed before the timeline starts, oldest first.
    pub state: Vec<HeaderedEvent>,
}

/// An incremental sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResponse {
    /// Token for the next request.
    pub next_batch: SyncToken,
    /// Rooms with activity, by room ID.
    pub rooms: BTreeMap<String, RoomResponse>,
}

impl SyncResponse {
    /// Returns true if no room had activity.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// A page of history returned by [`SyncStream::messages`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessagesPage {
    /// Events in the direction paginated.
    pub chunk: Vec<ClientEvent>,
    /// Token the page started at.
    pub start: SyncToken,
    /// Token to continue from, `None` once the log is exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<SyncToken>,
}

/// Builds sync responses from the output log.
#[derive(Debug, Clone)]
pub struct SyncStream {
    log: OutputLog,
    notifier: Arc<Notifier>,
    config: SyncConfig,
}

impl SyncStream {
    /// Creates a stream over `log`, woken by `notifier`.
    pub fn new(log: OutputLog, notifier: Arc<Notifier>, config: SyncConfig) -> Self {
        Self {
            log,
            notifier,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Answers an incremental sync, long-polling while nothing is new.
    #[instrument(skip_all, fields(since = ?request.since, session = ?request.session_id))]
    pub fn incremental(&self, ctx: &Context, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let since = request.since.map_or(StreamPosition::ZERO, SyncToken::position);
        let logged = self.log.select_max_event_id(ctx)?;
        self.notifier.on_new_event(logged);
        if since > logged {
            return Err(SyncError::InvalidToken(SyncToken(since).to_string()));
        }

        let mut current = self.notifier.current_position();
        if current <= since {
            let timeout = request
                .timeout
                .unwrap_or_else(|| self.config.long_poll_timeout_duration());
            if !timeout.is_zero() {
                current = self.notifier.wait_for_events(ctx, since, timeout);
            }
        }
        ctx.check()?;

        let mut response = SyncResponse {
            next_batch: SyncToken(current),
            rooms: BTreeMap::new(),
        };
        if current <= since {
            return Ok(response);
        }

        let range = Range::forward(since, current);
        let limit = self.config.timeline_limit(request.timeline_limit);
        let state = self
            .log
            .select_state_in_range(ctx, range, self.config.state_filter_limit)?;

        let mut rooms: BTreeSet<String> = state.needed.keys().cloned().collect();
        rooms.extend(self.log.select_rooms_in_range(ctx, range)?);
        if !request.rooms.is_empty() {
            let wanted: HashSet<&str> = request.rooms.iter().map(String::as_str).collect();
            rooms.retain(|room| wanted.contains(room.as_str()));
        }

        for room_id in rooms {
            let mut recent = self
                .log
                .select_recent_events(ctx, &room_id, range, limit + 1, true, true)?;
            let limited = recent.len() > limit;
            if limited {
                recent.remove(0);
            }
            let in_timeline: HashSet<&str> =
                recent.iter().map(|e| e.event.event_id()).collect();
            let room_state: Vec<HeaderedEvent> = state
                .room_state(&room_id)
                .into_iter()
                .filter(|e| !in_timeline.contains(e.event.event_id()))
                .map(|e| e.event.clone())
                .collect();
            if recent.is_empty() && room_state.is_empty() {
                continue;
            }

            let prev_batch = recent
                .first()
                .map(|e| SyncToken(StreamPosition(e.position.as_i64() - 1)));
            let events = recent
                .into_iter()
                .map(|e| client_event(e, request.session_id))
                .collect();
            response.rooms.insert(
                room_id,
                RoomResponse {
                    timeline: Timeline {
                        events,
                        limited,
                        prev_batch,
                    },
                    state: room_state,
                },
            );
        }
        debug!(rooms = response.rooms.len(), next = %response.next_batch, "sync assembled");
        Ok(response)
    }

    /// Pages through a room's history from `from`.
    ///
    /// Backwards pages run newest first, forward pages oldest first.
    pub fn messages(
        &self,
        ctx: &Context,
        room_id: &str,
        from: SyncToken,
        backwards: bool,
        limit: Option<usize>,
    ) -> SyncResult<MessagesPage> {
        if room_id.is_empty() {
            return Err(SyncError::InvalidRequest("room ID is required".into()));
        }
        let limit = self.config.timeline_limit(limit);
        let (events, end) = if backwards {
            let range = Range::backward(from.position(), StreamPosition::ZERO);
            let events = self
                .log
                .select_recent_events(ctx, room_id, range, limit, false, true)?;
            let end = match events.last() {
                Some(oldest) if events.len() == limit && oldest.position.as_i64() > 1 => {
                    Some(SyncToken(StreamPosition(oldest.position.as_i64() - 1)))
                }
                _ => None,
            };
            (events, end)
        } else {
            let max = self.log.select_max_event_id(ctx)?;
            let range = Range::forward(from.position(), max);
            let events = self.log.select_early_events(ctx, room_id, range, limit, true)?;
            let end = match events.last() {
                Some(newest) if events.len() == limit && newest.position < max => {
                    Some(SyncToken(newest.position))
                }
                _ => None,
            };
            (events, end)
        };
        Ok(MessagesPage {
            chunk: events.into_iter().map(|e| client_event(e, None)).collect(),
            start: from,
            end,
        })
    }
}

fn client_event(event: StreamEvent, session_id: Option<i64>) -> ClientEvent {
    let transaction_id = match (event.transaction_id, session_id) {
        (Some(txn), Some(session)) if txn.session_id == session => Some(txn.transaction_id),
        _ => None,
    };
    ClientEvent {
        event: event.event,
        position: event.position,
        transaction_id,
    }
}
