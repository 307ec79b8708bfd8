//! Property-based test generators using proptest.
//!
//! Histories are built from a small alphabet of users and state slots so
//! that generated steps overwrite each other often.

use crate::events::EventFactory;
use proptest::prelude::*;
use roomdb_event::{HeaderedEvent, RoomVersion, StateKeyTuple};
use serde_json::json;
use std::collections::BTreeMap;

/// Users generated histories draw from.
pub const USERS: [&str; 3] = ["@alice:test", "@bob:test", "@carol:test"];

/// One step of a generated room history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStep {
    /// A message.
    Message {
        /// Sender index into [`USERS`].
        sender: usize,
        /// Body.
        body: String,
    },
    /// A state event.
    State {
        /// Sender index into [`USERS`].
        sender: usize,
        /// Event type.
        event_type: String,
        /// State key.
        state_key: String,
        /// Value stored under `content.value`.
        value: u32,
    },
}

impl HistoryStep {
    /// Builds the event for this step on top of the factory's head.
    pub fn build(&self, factory: &mut EventFactory) -> HeaderedEvent {
        match self {
            Self::Message { sender, body } => factory.message(USERS[*sender], body),
            Self::State {
                sender,
                event_type,
                state_key,
                value,
            } => factory.state(
                USERS[*sender],
                event_type,
                state_key,
                json!({"value": value, "membership": "join"}),
            ),
        }
    }
}

/// Strategy for any supported room version.
pub fn room_version_strategy() -> impl Strategy<Value = RoomVersion> {
    prop::sample::select(RoomVersion::ALL.to_vec())
}

/// Strategy for a single history step.
pub fn history_step_strategy() -> impl Strategy<Value = HistoryStep> {
    let sender = 0..USERS.len();
    prop_oneof![
        1 => (sender.clone(), "[a-z]{1,12}")
            .prop_map(|(sender, body)| HistoryStep::Message { sender, body }),
        2 => (
            sender.clone(),
            prop::sample::select(vec!["m.room.name", "m.room.topic", "m.room.join_rules"]),
            any::<u32>(),
        )
            .prop_map(|(sender, event_type, value)| HistoryStep::State {
                sender,
                event_type: event_type.to_string(),
                state_key: String::new(),
                value,
            }),
        2 => (sender, 0..USERS.len(), any::<u32>()).prop_map(|(sender, member, value)| {
            HistoryStep::State {
                sender,
                event_type: "m.room.member".to_string(),
                state_key: USERS[member].to_string(),
                value,
            }
        }),
    ]
}

/// Strategy for a linear history of up to `max_len` steps after the create
/// event.
pub fn linear_history_strategy(max_len: usize) -> impl Strategy<Value = Vec<HistoryStep>> {
    prop::collection::vec(history_step_strategy(), 0..=max_len)
}

/// The state a linear history ends in: every state event in order, later
/// events replacing earlier ones in the same slot.
pub fn fold_linear_state(events: &[HeaderedEvent]) -> BTreeMap<StateKeyTuple, String> {
    let mut state = BTreeMap::new();
    for event in events {
        if let Some(tuple) = event.state_key_tuple() {
            state.insert(tuple, event.event_id().to_string());
        }
    }
    state
}
