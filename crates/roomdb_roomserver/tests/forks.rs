//! Divergent histories and their resolution.

use roomdb_event::{HeaderedEvent, RoomVersion, StateKeyTuple, M_ROOM_NAME};
use roomdb_roomserver::{InputRoomEvent, RoomServer, RoomUpdate};
use roomdb_storage::Context;
use roomdb_testkit::{EventFactory, TestStore};
use serde_json::json;

const ALICE: &str = "@alice:x";
const BOB: &str = "@bob:x";

struct Scenario {
    create: HeaderedEvent,
    join: HeaderedEvent,
    e3a: HeaderedEvent,
    e3b: HeaderedEvent,
    merge: HeaderedEvent,
}

fn scenario(version: RoomVersion) -> Scenario {
    let mut room = EventFactory::new("!r:x", version);
    let create = room.create(ALICE);
    let join = room.member(ALICE, "join");
    let head = room.head().to_vec();
    let e3a = room.build(ALICE, M_ROOM_NAME, Some(""), json!({"name": "a"}), &head);
    let e3b = room.build(BOB, M_ROOM_NAME, Some(""), json!({"name": "b"}), &head);
    let merge = room.build(
        ALICE,
        "m.room.message",
        None,
        json!({"body": "merged"}),
        &[e3a.event_id().to_string(), e3b.event_id().to_string()],
    );
    Scenario {
        create,
        join,
        e3a,
        e3b,
        merge,
    }
}

fn apply(server: &RoomServer, event: &HeaderedEvent) -> RoomUpdate {
    server
        .input(&Context::background(), &InputRoomEvent::new(event.clone()))
        .unwrap()
}

fn names(server: &RoomServer) -> Vec<String> {
    server
        .query()
        .latest_events_and_state(
            &Context::background(),
            "!r:x",
            &[StateKeyTuple::new(M_ROOM_NAME, "")],
        )
        .unwrap()
        .state_events
        .iter()
        .map(|e| e.content["name"].as_str().unwrap().to_string())
        .collect()
}

fn latest(server: &RoomServer) -> Vec<String> {
    let mut ids = server
        .query()
        .latest_events_and_state(&Context::background(), "!r:x", &[])
        .unwrap()
        .latest_event_ids;
    ids.sort();
    ids
}

#[test]
fn create_and_join_build_layered_state() {
    for fixture in TestStore::all() {
        let server = fixture.room_server();
        let s = scenario(RoomVersion::V1);

        let created = apply(&server, &s.create);
        let created = created.applied().unwrap();
        assert_eq!(created.latest_event_ids, vec![s.create.event_id()]);
        assert_eq!(created.adds_state_event_ids, vec![s.create.event_id()]);

        let joined = apply(&server, &s.join);
        let joined = joined.applied().unwrap();
        assert_eq!(joined.latest_event_ids, vec![s.join.event_id()]);
        assert_eq!(joined.adds_state_event_ids, vec![s.join.event_id()]);
        assert!(joined.removes_state_event_ids.is_empty());

        let state = server
            .query()
            .latest_events_and_state(&Context::background(), "!r:x", &[])
            .unwrap();
        assert!(state.room_exists);
        assert_eq!(state.room_version, Some(RoomVersion::V1));
        assert_eq!(state.state_events.len(), 2);
    }
}

#[test]
fn concurrent_names_resolve_to_one_winner_in_either_order() {
    for version in [RoomVersion::V1, RoomVersion::V6] {
        let s = scenario(version);
        let mut outcomes = Vec::new();

        for order in [[&s.e3a, &s.e3b], [&s.e3b, &s.e3a]] {
            let fixture = TestStore::memory();
            let server = fixture.room_server();
            apply(&server, &s.create);
            apply(&server, &s.join);
            for event in order {
                assert!(apply(&server, event).applied().is_some());
            }

            let mut expected_latest = vec![s.e3a.event_id().to_string(), s.e3b.event_id().to_string()];
            expected_latest.sort();
            assert_eq!(latest(&server), expected_latest);

            let names = names(&server);
            assert_eq!(names.len(), 1, "exactly one room name");
            outcomes.push(names[0].clone());
        }
        assert_eq!(outcomes[0], outcomes[1], "{version}: resolution depends on order");
    }
}

#[test]
fn v1_tie_break_prefers_smaller_event_id() {
    let s = scenario(RoomVersion::V1);
    let server = TestStore::memory().room_server();
    for event in [&s.create, &s.join, &s.e3b, &s.e3a] {
        apply(&server, event);
    }
    // Equal depth, so the smaller event ID wins.
    let winner = if s.e3a.event_id() < s.e3b.event_id() {
        "a"
    } else {
        "b"
    };
    assert_eq!(names(&server), vec![winner]);
}

#[test]
fn v6_prefers_the_creator() {
    let s = scenario(RoomVersion::V6);
    let server = TestStore::memory().room_server();
    for event in [&s.create, &s.join, &s.e3a, &s.e3b] {
        apply(&server, event);
    }
    // Alice created the room; Bob has no power.
    assert_eq!(names(&server), vec!["a"]);
}

#[test]
fn merge_event_collapses_extremities() {
    for fixture in TestStore::all() {
        let s = scenario(RoomVersion::V1);
        let server = fixture.room_server();
        for event in [&s.create, &s.join, &s.e3a, &s.e3b] {
            apply(&server, event);
        }
        let before = names(&server);

        let merged = apply(&server, &s.merge);
        let merged = merged.applied().unwrap();
        assert_eq!(merged.latest_event_ids, vec![s.merge.event_id()]);
        assert!(!merged.changes_state());
        assert_eq!(latest(&server), vec![s.merge.event_id().to_string()]);
        assert_eq!(names(&server), before);
    }
}

#[test]
fn fork_reports_delta_against_previous_state() {
    let s = scenario(RoomVersion::V6);
    let server = TestStore::memory().room_server();
    for event in [&s.create, &s.join] {
        apply(&server, event);
    }
    // Bob's name is applied first and then loses to Alice's.
    let first = apply(&server, &s.e3b);
    assert_eq!(
        first.applied().unwrap().adds_state_event_ids,
        vec![s.e3b.event_id()]
    );
    let second = apply(&server, &s.e3a);
    let second = second.applied().unwrap();
    assert_eq!(second.adds_state_event_ids, vec![s.e3a.event_id()]);
    assert_eq!(second.removes_state_event_ids, vec![s.e3b.event_id()]);
}
