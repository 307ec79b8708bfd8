//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use roomdb_event::{HeaderedEvent, RoomVersion};
use roomdb_testkit::{EventFactory, USERS};
use serde_json::json;

/// Generate a random message body of `len` characters.
pub fn random_body(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A room whose history mixes messages with topic and membership changes.
///
/// Roughly one event in `state_every` changes state.
pub fn mixed_room(room_id: &str, version: RoomVersion, events: usize, state_every: usize) -> Vec<HeaderedEvent> {
    let mut rng = rand::thread_rng();
    let mut room = EventFactory::new(room_id, version);
    let mut out = vec![room.create(USERS[0])];
    for n in 1..events {
        let sender = USERS[rng.gen_range(0..USERS.len())];
        let event = if state_every > 0 && rng.gen_range(0..state_every) == 0 {
            if rng.gen_bool(0.5) {
                room.state(sender, "m.room.topic", "", json!({"topic": random_body(16)}))
            } else {
                room.member(sender, "join")
            }
        } else {
            room.message(sender, &format!("{n} {}", random_body(32)))
        };
        out.push(event);
    }
    out
}
