//! Builders for valid room events.

use roomdb_event::{
    Event, EventIdFormat, HeaderedEvent, RoomVersion, M_ROOM_CREATE, M_ROOM_MEMBER, M_ROOM_MESSAGE,
    M_ROOM_NAME,
};
use serde_json::{json, Value};
use std::collections::HashMap;

/// First timestamp handed out by [`EventFactory`].
pub const BASE_TS: i64 = 1_600_000_000_000;

/// Builds the events of one room.
///
/// The factory tracks a head: the events the next convenience-built event
/// lists as its prev events. Timestamps increase by one per event and depth
/// is one more than the deepest prev event.
#[derive(Debug, Clone)]
pub struct EventFactory {
    room_id: String,
    version: RoomVersion,
    server: String,
    counter: u64,
    clock: i64,
    depths: HashMap<String, i64>,
    head: Vec<String>,
}

impl EventFactory {
    /// Creates a factory for `room_id`.
    pub fn new(room_id: impl Into<String>, version: RoomVersion) -> Self {
        let room_id = room_id.into();
        let server = room_id
            .split_once(':')
            .map_or("test", |(_, server)| server)
            .to_string();
        Self {
            room_id,
            version,
            server,
            counter: 0,
            clock: BASE_TS,
            depths: HashMap::new(),
            head: Vec::new(),
        }
    }

    /// Returns the room ID.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Returns the room version.
    pub fn version(&self) -> RoomVersion {
        self.version
    }

    /// Returns the current head.
    pub fn head(&self) -> &[String] {
        &self.head
    }

    /// Replaces the head, e.g. to merge two branches.
    pub fn set_head(&mut self, head: Vec<String>) {
        self.head = head;
    }

    /// Sets the timestamp of the next event.
    pub fn set_clock(&mut self, ts: i64) {
        self.clock = ts;
    }

    /// The `m.room.create` event. Resets the head to it.
    pub fn create(&mut self, sender: &str) -> HeaderedEvent {
        let event = self.build(
            sender,
            M_ROOM_CREATE,
            Some(""),
            json!({"creator": sender, "room_version": self.version.as_str()}),
            &[],
        );
        self.head = vec![event.event_id().to_string()];
        event
    }

    /// A state event on top of the head.
    pub fn state(&mut self, sender: &str, event_type: &str, state_key: &str, content: Value) -> HeaderedEvent {
        self.advance(sender, event_type, Some(state_key), content)
    }

    /// A membership event of `user_id` on top of the head.
    pub fn member(&mut self, user_id: &str, membership: &str) -> HeaderedEvent {
        self.advance(
            user_id,
            M_ROOM_MEMBER,
            Some(user_id),
            json!({"membership": membership}),
        )
    }

    /// A room name event on top of the head.
    pub fn name(&mut self, sender: &str, name: &str) -> HeaderedEvent {
        self.advance(sender, M_ROOM_NAME, Some(""), json!({"name": name}))
    }

    /// A message on top of the head.
    pub fn message(&mut self, sender: &str, body: &str) -> HeaderedEvent {
        self.advance(
            sender,
            M_ROOM_MESSAGE,
            None,
            json!({"msgtype": "m.text", "body": body}),
        )
    }

    /// Builds an event on top of the head and moves the head to it.
    pub fn advance(
        &mut self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
    ) -> HeaderedEvent {
        let prev = self.head.clone();
        let event = self.build(sender, event_type, state_key, content, &prev);
        self.head = vec![event.event_id().to_string()];
        event
    }

    /// Builds an event with explicit prev events. The head is untouched.
    pub fn build(
        &mut self,
        sender: &str,
        event_type: &str,
        state_key: Option<&str>,
        content: Value,
        prev_events: &[String],
    ) -> HeaderedEvent {
        self.counter += 1;
        let event_id = match self.version.event_id_format() {
            EventIdFormat::Origin => format!("${}:{}", self.counter, self.server),
            _ => String::new(),
        };
        let depth = prev_events
            .iter()
            .filter_map(|id| self.depths.get(id))
            .max()
            .map_or(1, |d| d + 1);
        let origin_server_ts = self.clock;
        self.clock += 1;

        let event = HeaderedEvent::new(
            self.version,
            Event {
                event_id,
                room_id: self.room_id.clone(),
                sender: sender.to_string(),
                event_type: event_type.to_string(),
                state_key: state_key.map(str::to_string),
                prev_events: prev_events.to_vec(),
                auth_events: Vec::new(),
                depth,
                origin_server_ts,
                content,
            },
        )
        .expect("factory builds valid events");
        self.depths.insert(event.event_id().to_string(), depth);
        event
    }
}
