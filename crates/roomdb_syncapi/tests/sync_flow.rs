//! Room server outputs flowing into sync responses.

use roomdb_event::{HeaderedEvent, RoomVersion};
use roomdb_roomserver::{InputRoomEvent, RoomServer};
use roomdb_storage::Context;
use roomdb_syncapi::{SyncApi, SyncConfig, SyncRequest, SyncResponse, SyncToken};
use roomdb_testkit::{with_each_store, EventFactory, TestStore};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ALICE: &str = "@alice:test";
const BOB: &str = "@bob:test";

struct Harness {
    server: RoomServer,
    sync: SyncApi,
}

impl Harness {
    fn new(fixture: &TestStore) -> Self {
        Self {
            server: fixture.room_server(),
            sync: SyncApi::new(Arc::clone(&fixture.store), SyncConfig::default()).unwrap(),
        }
    }

    fn input(&self, event: HeaderedEvent) {
        self.input_with(InputRoomEvent::new(event));
    }

    fn input_with(&self, input: InputRoomEvent) {
        let ctx = Context::background();
        let update = self.server.input(&ctx, &input).unwrap();
        let output = update.applied().expect("event applied");
        self.sync.consumer().on_output(&ctx, output).unwrap();
    }

    fn sync(&self, since: Option<SyncToken>, limit: Option<usize>) -> SyncResponse {
        let request = SyncRequest {
            since,
            timeline_limit: limit,
            timeout: Some(Duration::ZERO),
            ..SyncRequest::default()
        };
        self.sync
            .stream()
            .incremental(&Context::background(), &request)
            .unwrap()
    }
}

fn ids(events: &[HeaderedEvent]) -> Vec<String> {
    events.iter().map(|e| e.event_id().to_string()).collect()
}

#[test]
fn initial_sync_returns_the_room() {
    with_each_store(|fixture| {
        let h = Harness::new(fixture);
        let mut room = EventFactory::new("!room:test", RoomVersion::V6);
        let mut sent = vec![room.create(ALICE), room.member(ALICE, "join")];
        sent.push(room.name(ALICE, "Lobby"));
        sent.push(room.message(ALICE, "hello"));
        for event in &sent {
            h.input(event.clone());
        }

        let response = h.sync(None, None);
        assert_eq!(response.next_batch, SyncToken(roomdb_syncapi::StreamPosition(4)));
        let lobby = &response.rooms["!room:test"];
        let timeline: Vec<HeaderedEvent> =
            lobby.timeline.events.iter().map(|e| e.event.clone()).collect();
        assert_eq!(ids(&timeline), ids(&sent));
        assert!(!lobby.timeline.limited);
        // All state changes are already in the timeline.
        assert!(lobby.state.is_empty());

        let again = h.sync(Some(response.next_batch), None);
        assert!(again.is_empty());
        assert_eq!(again.next_batch, response.next_batch);
    });
}

#[test]
fn limited_timeline_carries_state_from_the_gap() {
    with_each_store(|fixture| {
        let h = Harness::new(fixture);
        let mut room = EventFactory::new("!room:test", RoomVersion::V6);
        h.input(room.create(ALICE));
        h.input(room.member(ALICE, "join"));
        let since = h.sync(None, None).next_batch;

        let renamed = room.name(ALICE, "Renamed");
        h.input(renamed.clone());
        let mut messages = Vec::new();
        for n in 0..8 {
            let message = room.message(ALICE, &format!("m{n}"));
            h.input(message.clone());
            messages.push(message);
        }

        let response = h.sync(Some(since), Some(3));
        let lobby = &response.rooms["!room:test"];
        assert!(lobby.timeline.limited);
        let timeline: Vec<HeaderedEvent> =
            lobby.timeline.events.iter().map(|e| e.event.clone()).collect();
        assert_eq!(ids(&timeline), ids(&messages[5..]));
        assert_eq!(ids(&lobby.state), vec![renamed.event_id().to_string()]);

        let oldest = lobby.timeline.events[0].position;
        assert_eq!(
            lobby.timeline.prev_batch.unwrap().position().as_i64(),
            oldest.as_i64() - 1
        );
    });
}

#[test]
fn replaced_state_in_the_gap_is_not_sent() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let mut room = EventFactory::new("!room:test", RoomVersion::V1);
    h.input(room.create(ALICE));
    h.input(room.member(ALICE, "join"));
    let since = h.sync(None, None).next_batch;

    h.input(room.name(ALICE, "first"));
    let second = room.name(ALICE, "second");
    h.input(second.clone());
    h.input(room.message(ALICE, "after"));

    let response = h.sync(Some(since), Some(1));
    let lobby = &response.rooms["!room:test"];
    assert_eq!(ids(&lobby.state), vec![second.event_id().to_string()]);
}

#[test]
fn transaction_ids_echo_to_the_sending_session_only() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let mut room = EventFactory::new("!room:test", RoomVersion::V6);
    h.input(room.create(ALICE));
    h.input_with(InputRoomEvent::new(room.message(ALICE, "hi")).with_transaction_id(7, "txn-1"));

    let sync_as = |session_id| {
        let request = SyncRequest {
            session_id,
            timeout: Some(Duration::ZERO),
            ..SyncRequest::default()
        };
        h.sync
            .stream()
            .incremental(&Context::background(), &request)
            .unwrap()
    };
    let txn_ids = |response: SyncResponse| -> Vec<Option<String>> {
        response.rooms["!room:test"]
            .timeline
            .events
            .iter()
            .map(|e| e.transaction_id.clone())
            .collect()
    };

    assert_eq!(txn_ids(sync_as(Some(7))), vec![None, Some("txn-1".to_string())]);
    assert_eq!(txn_ids(sync_as(Some(8))), vec![None, None]);
    assert_eq!(txn_ids(sync_as(None)), vec![None, None]);
}

#[test]
fn room_filter_and_message_only_rooms() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let mut a = EventFactory::new("!a:test", RoomVersion::V6);
    let mut b = EventFactory::new("!b:test", RoomVersion::V6);
    h.input(a.create(ALICE));
    h.input(b.create(BOB));
    let since = h.sync(None, None).next_batch;

    h.input(b.message(BOB, "only b talks"));
    let response = h.sync(Some(since), None);
    assert_eq!(response.rooms.keys().collect::<Vec<_>>(), vec!["!b:test"]);

    let request = SyncRequest {
        rooms: vec!["!a:test".into()],
        timeout: Some(Duration::ZERO),
        ..SyncRequest::default()
    };
    let filtered = h
        .sync
        .stream()
        .incremental(&Context::background(), &request)
        .unwrap();
    assert!(filtered.rooms.contains_key("!a:test"));
    assert!(!filtered.rooms.contains_key("!b:test"));
}

#[test]
fn future_token_is_rejected() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let request = SyncRequest {
        since: Some("s99".parse().unwrap()),
        timeout: Some(Duration::ZERO),
        ..SyncRequest::default()
    };
    let err = h
        .sync
        .stream()
        .incremental(&Context::background(), &request)
        .unwrap_err();
    assert!(err.is_client_error());
}

#[test]
fn long_poll_wakes_on_new_event() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let mut room = EventFactory::new("!room:test", RoomVersion::V6);
    h.input(room.create(ALICE));
    let since = h.sync(None, None).next_batch;

    let stream = h.sync.stream().clone();
    let waiter = thread::spawn(move || {
        let request = SyncRequest {
            since: Some(since),
            timeout: Some(Duration::from_secs(10)),
            ..SyncRequest::default()
        };
        stream.incremental(&Context::background(), &request).unwrap()
    });

    thread::sleep(Duration::from_millis(50));
    let message = room.message(ALICE, "wake up");
    h.input(message.clone());

    let response = waiter.join().unwrap();
    let events = &response.rooms["!room:test"].timeline.events;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.event_id(), message.event_id());
}

#[test]
fn backfilled_events_stay_out_of_timelines() {
    let fixture = TestStore::memory();
    let h = Harness::new(&fixture);
    let mut room = EventFactory::new("!room:test", RoomVersion::V1);
    let create = room.create(ALICE);
    h.input(create.clone());
    let since = h.sync(None, None).next_batch;

    let head = room.head().to_vec();
    let old = room.build(BOB, "m.room.message", None, serde_json::json!({"body": "old"}), &head);
    h.input_with(InputRoomEvent::backfill(old));

    let response = h.sync(Some(since), None);
    assert!(response.is_empty());
    assert!(response.next_batch > since);
}

#[test]
fn spawned_consumer_follows_the_feed() {
    let fixture = TestStore::memory();
    let server = fixture.room_server();
    let sync = SyncApi::new(Arc::clone(&fixture.store), SyncConfig::default()).unwrap();
    let ctx = Context::background();
    let mut room = EventFactory::new("!room:test", RoomVersion::V6);

    // Published before the consumer starts; replayed from feed history.
    server
        .input(&ctx, &InputRoomEvent::new(room.create(ALICE)))
        .unwrap();
    let worker = sync.spawn_consumer(ctx.clone(), server.feed()).unwrap();
    for n in 0..5 {
        server
            .input(&ctx, &InputRoomEvent::new(room.message(ALICE, &format!("m{n}"))))
            .unwrap();
    }

    let request = SyncRequest {
        timeout: Some(Duration::from_secs(10)),
        since: Some(SyncToken(roomdb_syncapi::StreamPosition(5))),
        ..SyncRequest::default()
    };
    let response = sync.stream().incremental(&ctx, &request).unwrap();
    assert_eq!(response.next_batch.position().as_i64(), 6);

    ctx.cancel();
    assert_eq!(worker.join().unwrap().unwrap(), 5);
}
