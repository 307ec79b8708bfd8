//! Deterministic merging of divergent room state.
//!
//! Slots on which every input state agrees are copied through. For each
//! conflicted slot the candidates are put in a total order and the first one
//! wins, so the result depends only on the set of input states and never on
//! the order they are given in.
//!
//! - [`StateResAlgorithm::V1`]: greatest depth, then smallest event ID.
//! - [`StateResAlgorithm::V2`]: the power levels slot is resolved first,
//!   judged by the room creator's power. Every other slot is then ordered by
//!   the sender's power under the resolved power levels, then the latest
//!   `origin_server_ts`, then the smallest event ID.

use crate::error::{RoomServerError, RoomServerResult};
use crate::event_store::EventStore;
use crate::types::StateMap;
use roomdb_event::{HeaderedEvent, RoomVersion, StateResAlgorithm};
use roomdb_storage::{EventNid, EventStateKeyNid, EventTypeNid, StateKey, Txn};
use serde_json::Value;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// The `m.room.create` slot.
pub const CREATE_KEY: StateKey = StateKey::new(EventTypeNid(1), EventStateKeyNid(1));

/// The `m.room.power_levels` slot.
pub const POWER_LEVELS_KEY: StateKey = StateKey::new(EventTypeNid(2), EventStateKeyNid(1));

/// Power of the room creator while no power levels event is in effect.
pub const CREATOR_POWER: i64 = 100;

/// Input states split into agreed and disputed slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitState {
    /// Slots with a single candidate.
    pub unconflicted: StateMap,
    /// Slots with several candidates, each list sorted and deduplicated.
    pub conflicted: BTreeMap<StateKey, Vec<EventNid>>,
}

/// Splits states into unconflicted and conflicted slots. A slot missing from
/// some states but holding the same event in all others is unconflicted.
#[must_use]
pub fn split_states(states: &[StateMap]) -> SplitState {
    let mut candidates: BTreeMap<StateKey, BTreeSet<EventNid>> = BTreeMap::new();
    for state in states {
        for (key, nid) in state {
            candidates.entry(*key).or_default().insert(*nid);
        }
    }
    let mut split = SplitState::default();
    for (key, nids) in candidates {
        if nids.len() == 1 {
            split.unconflicted.extend(nids.into_iter().map(|nid| (key, nid)));
        } else {
            split.conflicted.insert(key, nids.into_iter().collect());
        }
    }
    split
}

/// Resolves conflicts between room states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateResolver {
    algorithm: StateResAlgorithm,
}

impl StateResolver {
    /// Creates a resolver for an explicit ordering.
    #[must_use]
    pub const fn new(algorithm: StateResAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Creates the resolver a room version prescribes.
    #[must_use]
    pub const fn for_version(version: RoomVersion) -> Self {
        Self::new(version.state_res_algorithm())
    }

    /// Returns the ordering in use.
    #[must_use]
    pub const fn algorithm(&self) -> StateResAlgorithm {
        self.algorithm
    }

    /// Event NIDs whose payloads [`resolve`](Self::resolve) will consult.
    #[must_use]
    pub fn events_needed(&self, states: &[StateMap]) -> Vec<EventNid> {
        let split = split_states(states);
        let mut needed: BTreeSet<EventNid> = split.conflicted.values().flatten().copied().collect();
        if self.algorithm == StateResAlgorithm::V2 && !split.conflicted.is_empty() {
            for key in [CREATE_KEY, POWER_LEVELS_KEY] {
                needed.extend(split.unconflicted.get(&key).copied());
            }
        }
        needed.into_iter().collect()
    }

    /// Merges `states` into one. `events` must hold every event listed by
    /// [`events_needed`](Self::events_needed).
    pub fn resolve(
        &self,
        states: &[StateMap],
        events: &HashMap<EventNid, HeaderedEvent>,
    ) -> RoomServerResult<StateMap> {
        let split = split_states(states);
        if split.conflicted.is_empty() {
            return Ok(split.unconflicted);
        }
        debug!(
            algorithm = ?self.algorithm,
            conflicted = split.conflicted.len(),
            "resolving state"
        );
        let lookup = |nid: &EventNid| {
            events
                .get(nid)
                .map(|event| (*nid, event))
                .ok_or_else(|| RoomServerError::Inconsistent(format!("missing event {nid}")))
        };

        let mut resolved = split.unconflicted;
        match self.algorithm {
            StateResAlgorithm::V1 => {
                for (key, nids) in &split.conflicted {
                    let candidates = nids.iter().map(lookup).collect::<RoomServerResult<Vec<_>>>()?;
                    if let Some(winner) = pick(candidates, |(_, event)| Reverse(event.depth)) {
                        resolved.insert(*key, winner);
                    }
                }
            }
            StateResAlgorithm::V2 => {
                let create = resolved.get(&CREATE_KEY).map(lookup).transpose()?;
                let creator = create.map(|(_, event)| room_creator(event));
                let base_power = PowerLevels::initial(creator);

                if let Some(nids) = split.conflicted.get(&POWER_LEVELS_KEY) {
                    let candidates = nids.iter().map(lookup).collect::<RoomServerResult<Vec<_>>>()?;
                    if let Some(winner) = pick(candidates, |(_, event)| v2_rank(&base_power, event)) {
                        resolved.insert(POWER_LEVELS_KEY, winner);
                    }
                }
                let power = match resolved.get(&POWER_LEVELS_KEY) {
                    Some(nid) => PowerLevels::from_event(lookup(nid)?.1, base_power),
                    None => base_power,
                };

                for (key, nids) in &split.conflicted {
                    if *key == POWER_LEVELS_KEY {
                        continue;
                    }
                    let candidates = nids.iter().map(lookup).collect::<RoomServerResult<Vec<_>>>()?;
                    if let Some(winner) = pick(candidates, |(_, event)| v2_rank(&power, event)) {
                        resolved.insert(*key, winner);
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Loads whatever [`resolve`](Self::resolve) needs through `txn` and
    /// resolves.
    pub fn resolve_in<T: Txn + ?Sized>(
        &self,
        txn: &T,
        states: &[StateMap],
    ) -> RoomServerResult<StateMap> {
        if states.len() == 1 {
            return Ok(states[0].clone());
        }
        let needed = self.events_needed(states);
        let loaded = txn.events_by_nid(&needed)?;
        if loaded.len() != needed.len() {
            return Err(RoomServerError::Inconsistent(format!(
                "state resolution found {} of {} events",
                loaded.len(),
                needed.len()
            )));
        }
        let events = loaded
            .into_iter()
            .map(|stored| (stored.event_nid, stored.event))
            .collect();
        self.resolve(states, &events)
    }
}

/// Returns the candidate with the smallest rank, breaking ties by event ID.
fn pick<'a, R: Ord>(
    candidates: Vec<(EventNid, &'a HeaderedEvent)>,
    rank: impl Fn(&(EventNid, &'a HeaderedEvent)) -> R,
) -> Option<EventNid> {
    candidates
        .into_iter()
        .min_by(|a, b| match rank(a).cmp(&rank(b)) {
            Ordering::Equal => a.1.event_id().cmp(b.1.event_id()),
            other => other,
        })
        .map(|(nid, _)| nid)
}

fn v2_rank(power: &PowerLevels, event: &HeaderedEvent) -> (Reverse<i64>, Reverse<i64>) {
    (
        Reverse(power.user_level(&event.sender)),
        Reverse(event.origin_server_ts),
    )
}

fn room_creator(create: &HeaderedEvent) -> String {
    create
        .content
        .get("creator")
        .and_then(Value::as_str)
        .unwrap_or(&create.sender)
        .to_string()
}

/// The parts of `m.room.power_levels` that ordering needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PowerLevels {
    users: HashMap<String, i64>,
    users_default: i64,
}

impl PowerLevels {
    fn initial(creator: Option<String>) -> Self {
        Self {
            users: creator.into_iter().map(|c| (c, CREATOR_POWER)).collect(),
            users_default: 0,
        }
    }

    /// Reads a power levels event. Malformed content falls back to `base`.
    fn from_event(event: &HeaderedEvent, base: PowerLevels) -> Self {
        let Some(content) = event.content.as_object() else {
            return base;
        };
        let users = content
            .get("users")
            .and_then(Value::as_object)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|(user, level)| level_value(level).map(|l| (user.clone(), l)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            users,
            users_default: content
                .get("users_default")
                .and_then(level_value)
                .unwrap_or(0),
        }
    }

    fn user_level(&self, user_id: &str) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }
}

// Older rooms carry levels as strings.
fn level_value(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomdb_event::Event;
    use serde_json::json;

    const NAME_KEY: StateKey = StateKey::new(EventTypeNid(8), EventStateKeyNid(1));

    fn event(id: &str, sender: &str, event_type: &str, depth: i64, ts: i64, content: Value) -> HeaderedEvent {
        HeaderedEvent::new(
            RoomVersion::V1,
            Event {
                event_id: id.to_string(),
                room_id: "!r:x".into(),
                sender: sender.into(),
                event_type: event_type.into(),
                state_key: Some(String::new()),
                prev_events: if event_type == "m.room.create" {
                    vec![]
                } else {
                    vec!["$c:x".into()]
                },
                auth_events: vec![],
                depth,
                origin_server_ts: ts,
                content,
            },
        )
        .unwrap()
    }

    fn fixture() -> HashMap<EventNid, HeaderedEvent> {
        HashMap::from([
            (
                EventNid(1),
                event("$c:x", "@alice:x", "m.room.create", 1, 0, json!({"creator": "@alice:x"})),
            ),
            (EventNid(2), event("$a:x", "@bob:x", "m.room.name", 5, 50, json!({"name": "a"}))),
            (EventNid(3), event("$b:x", "@alice:x", "m.room.name", 3, 10, json!({"name": "b"}))),
            (EventNid(4), event("$z:x", "@carol:x", "m.room.name", 5, 50, json!({"name": "z"}))),
        ])
    }

    fn state(name: i64) -> StateMap {
        StateMap::from([(CREATE_KEY, EventNid(1)), (NAME_KEY, EventNid(name))])
    }

    #[test]
    fn split_ignores_absent_slots() {
        let mut partial = state(2);
        partial.remove(&NAME_KEY);
        let split = split_states(&[state(2), partial]);
        assert!(split.conflicted.is_empty());
        assert_eq!(split.unconflicted, state(2));

        let split = split_states(&[state(2), state(3), state(2)]);
        assert_eq!(split.conflicted[&NAME_KEY], vec![EventNid(2), EventNid(3)]);
    }

    #[test]
    fn v1_prefers_depth_then_event_id() {
        let events = fixture();
        let resolver = StateResolver::new(StateResAlgorithm::V1);
        let out = resolver.resolve(&[state(3), state(2)], &events).unwrap();
        assert_eq!(out[&NAME_KEY], EventNid(2));

        // Equal depth: "$a:x" sorts before "$z:x".
        let out = resolver.resolve(&[state(4), state(2)], &events).unwrap();
        assert_eq!(out[&NAME_KEY], EventNid(2));
    }

    #[test]
    fn v2_prefers_sender_power() {
        let events = fixture();
        let resolver = StateResolver::new(StateResAlgorithm::V2);
        // Alice created the room, so her older and shallower event wins.
        let out = resolver.resolve(&[state(2), state(3)], &events).unwrap();
        assert_eq!(out[&NAME_KEY], EventNid(3));
        assert_eq!(
            resolver.events_needed(&[state(2), state(3)]),
            vec![EventNid(1), EventNid(2), EventNid(3)]
        );
    }

    #[test]
    fn v2_uses_resolved_power_levels() {
        let mut events = fixture();
        events.insert(
            EventNid(5),
            event(
                "$pl:x",
                "@alice:x",
                "m.room.power_levels",
                2,
                5,
                json!({"users": {"@alice:x": 100, "@carol:x": "50"}, "users_default": 10}),
            ),
        );
        let with_pl = |name| {
            let mut s = state(name);
            s.insert(POWER_LEVELS_KEY, EventNid(5));
            s
        };
        let resolver = StateResolver::new(StateResAlgorithm::V2);
        // Carol (50) beats Bob (10) at equal timestamps.
        let out = resolver.resolve(&[with_pl(2), with_pl(4)], &events).unwrap();
        assert_eq!(out[&NAME_KEY], EventNid(4));
        assert_eq!(out[&POWER_LEVELS_KEY], EventNid(5));
    }

    #[test]
    fn input_order_does_not_matter() {
        let events = fixture();
        for algorithm in [StateResAlgorithm::V1, StateResAlgorithm::V2] {
            let resolver = StateResolver::new(algorithm);
            let forward = resolver
                .resolve(&[state(2), state(3), state(4)], &events)
                .unwrap();
            let backward = resolver
                .resolve(&[state(4), state(3), state(2)], &events)
                .unwrap();
            assert_eq!(forward, backward);
        }
    }

    #[test]
    fn missing_payload_is_inconsistent() {
        let mut events = fixture();
        events.remove(&EventNid(3));
        let resolver = StateResolver::new(StateResAlgorithm::V1);
        let err = resolver.resolve(&[state(2), state(3)], &events).unwrap_err();
        assert!(matches!(err, RoomServerError::Inconsistent(_)));
    }
}
