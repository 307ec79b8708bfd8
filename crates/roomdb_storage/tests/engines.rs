//! Behaviour every engine must share.

use roomdb_storage::{
    Context, EventNid, EventStateKeyNid, EventTypeNid, LatestEvents, MemoryStore, NewEvent,
    NidKind, OutputEventRow, OutputEventsQuery, ScanOrder, SqliteStore, StateEntry, StateKey,
    StateSnapshotNid, Store, StreamPosition, GLOBAL_STREAM,
};

fn engines() -> Vec<Box<dyn Store>> {
    vec![
        Box::new(MemoryStore::new()),
        Box::new(SqliteStore::open_in_memory().unwrap()),
    ]
}

fn new_event(room_nid: roomdb_storage::RoomNid, id: &str, state: bool) -> NewEvent {
    NewEvent {
        room_nid,
        event_id: id.to_string(),
        event_type_nid: EventTypeNid(if state { 5 } else { 9 }),
        event_state_key_nid: state.then_some(EventStateKeyNid(1)),
        depth: 1,
        prev_event_nids: vec![],
        state_snapshot_nid: StateSnapshotNid::EMPTY,
        event_json: format!(r#"{{"event_id":"{id}"}}"#),
    }
}

fn output_row(position: i64, room: &str, id: &str) -> OutputEventRow {
    OutputEventRow {
        position: StreamPosition(position),
        room_id: room.to_string(),
        event_id: id.to_string(),
        event_json: "{}".to_string(),
        event_type: "m.room.message".to_string(),
        sender: "@alice:x".to_string(),
        contains_url: false,
        add_state_ids: None,
        remove_state_ids: None,
        session_id: None,
        transaction_id: None,
        exclude_from_sync: false,
    }
}

#[test]
fn rooms_and_latest_events() {
    for store in engines() {
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        let room = txn.insert_room_nid("!r:x", "6").unwrap();
        assert_eq!(txn.insert_room_nid("!r:x", "6").unwrap(), room);

        let info = txn.select_room_info("!r:x").unwrap().unwrap();
        assert_eq!(info.room_version, "6");
        assert!(info.latest.latest_event_nids.is_empty());
        assert!(info.latest.state_snapshot_nid.is_empty());

        let (e1, _) = txn.insert_event(&new_event(room, "$e1", true)).unwrap();
        let latest = LatestEvents {
            latest_event_nids: vec![e1],
            last_event_sent_nid: e1,
            state_snapshot_nid: StateSnapshotNid(1),
        };
        let locked = txn.select_latest_events_for_update(room).unwrap();
        assert!(locked.latest_event_nids.is_empty());
        txn.update_latest_event_nids(room, &latest).unwrap();
        txn.commit().unwrap();

        let txn = store.begin(&ctx).unwrap();
        assert_eq!(
            txn.select_latest_event_nids(room).unwrap(),
            (vec![e1], StateSnapshotNid(1)),
            "engine {}",
            store.engine()
        );
        assert!(txn.select_room_version(roomdb_storage::RoomNid(99)).is_err());
    }
}

#[test]
fn room_rows_roll_back() {
    for store in engines() {
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        let room = txn.insert_room_nid("!r:x", "1").unwrap();
        assert_eq!(txn.select_room_version(room).unwrap(), "1");
        txn.rollback().unwrap();

        let mut txn = store.begin(&ctx).unwrap();
        assert_eq!(txn.select_room_info("!r:x").unwrap(), None, "engine {}", store.engine());
        let room = txn.insert_room_nid("!r:x", "6").unwrap();
        assert_eq!(txn.select_room_version(room).unwrap(), "6");
        txn.commit().unwrap();

        let txn = store.begin(&ctx).unwrap();
        assert_eq!(txn.select_room_info("!r:x").unwrap().unwrap().room_version, "6");
    }
}

#[test]
fn nid_tables_round_trip() {
    for store in engines() {
        let mut txn = store.begin(&Context::background()).unwrap();
        let topic = txn.insert_nid(NidKind::EventType, "m.room.topic").unwrap();
        let alice = txn.insert_nid(NidKind::EventStateKey, "@alice:x").unwrap();

        let nids = txn
            .bulk_select_nids(
                NidKind::EventType,
                &["m.room.topic".to_string(), "m.unknown".to_string()],
            )
            .unwrap();
        assert_eq!(nids.len(), 1);
        assert_eq!(nids["m.room.topic"], topic);

        let strings = txn
            .bulk_select_strings(NidKind::EventStateKey, &[alice, 1, 4242])
            .unwrap();
        assert_eq!(strings[&alice], "@alice:x");
        assert_eq!(strings[&1], "");
        assert_eq!(strings.len(), 2);
    }
}

#[test]
fn events_and_previous_links() {
    for store in engines() {
        let mut txn = store.begin(&Context::background()).unwrap();
        let room = txn.insert_room_nid("!r:x", "6").unwrap();
        let (a, _) = txn.insert_event(&new_event(room, "$a", true)).unwrap();
        let (b, _) = txn.insert_event(&new_event(room, "$b", false)).unwrap();
        txn.insert_previous_event("$a", b).unwrap();
        txn.insert_previous_event("$a", b).unwrap();

        assert!(txn.select_previous_event_exists("$a").unwrap());
        assert!(!txn.select_previous_event_exists("$b").unwrap());

        let rows = txn
            .bulk_select_events_by_id(&["$b".into(), "$a".into(), "$zzz".into()])
            .unwrap();
        let nids: Vec<EventNid> = rows.iter().map(|r| r.event_nid).collect();
        assert_eq!(nids, vec![a, b]);
        assert!(rows[1].state_key().is_none());

        let map = txn
            .bulk_select_event_nids(&["$a".into(), "$nope".into()])
            .unwrap();
        assert_eq!(map.len(), 1);
    }
}

#[test]
fn state_blocks_and_snapshots() {
    for store in engines() {
        let mut txn = store.begin(&Context::background()).unwrap();
        let room = txn.insert_room_nid("!r:x", "6").unwrap();
        let key = |t, k| StateKey::new(EventTypeNid(t), EventStateKeyNid(k));

        let b1 = txn
            .insert_state_block(&[
                StateEntry::new(key(5, 2), EventNid(2)),
                StateEntry::new(key(1, 1), EventNid(1)),
            ])
            .unwrap();
        let b2 = txn
            .insert_state_block(&[StateEntry::new(key(5, 2), EventNid(3))])
            .unwrap();
        let again = txn
            .insert_state_block(&[
                StateEntry::new(key(1, 1), EventNid(1)),
                StateEntry::new(key(5, 2), EventNid(2)),
            ])
            .unwrap();
        assert_eq!(b1, again);

        let s1 = txn.insert_state_snapshot(room, &[b1]).unwrap();
        let s2 = txn.insert_state_snapshot(room, &[b1, b2]).unwrap();
        let s3 = txn.insert_state_snapshot(room, &[b1, b2]).unwrap();
        assert_ne!(s2, s3, "snapshots are never deduplicated");

        let lists = txn.bulk_select_state_block_nids(&[s2, s1]).unwrap();
        assert_eq!(lists[0].state_snapshot_nid, s1);
        assert_eq!(lists[1].state_block_nids, vec![b1, b2]);

        let blocks = txn.bulk_select_state_block_entries(&[b2, b1]).unwrap();
        assert_eq!(blocks[0].state_block_nid, b1);
        assert_eq!(blocks[0].entries[0].key, key(1, 1));
        assert_eq!(blocks[1].entries, vec![StateEntry::new(key(5, 2), EventNid(3))]);

        assert!(txn
            .bulk_select_state_block_entries(&[b1, roomdb_storage::StateBlockNid(999)])
            .is_err());
    }
}

#[test]
fn output_log_scans() {
    for store in engines() {
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        for i in 1..=6 {
            let pos = txn.next_stream_position(GLOBAL_STREAM).unwrap();
            assert_eq!(pos, StreamPosition(i));
            let room = if i % 2 == 0 { "!even:x" } else { "!odd:x" };
            let mut row = output_row(pos.0, room, &format!("$e{i}"));
            row.exclude_from_sync = i == 4;
            if i == 2 {
                row.add_state_ids = Some(vec!["$e2".into()]);
            }
            txn.insert_output_event(&row).unwrap();
        }
        txn.commit().unwrap();

        let txn = store.begin(&ctx).unwrap();
        let mut query = OutputEventsQuery {
            room_id: "!even:x",
            low: StreamPosition(0),
            high: StreamPosition(6),
            limit: 10,
            order: ScanOrder::Descending,
            only_sync_visible: false,
        };
        let ids = |rows: Vec<OutputEventRow>| -> Vec<String> {
            rows.into_iter().map(|r| r.event_id).collect()
        };
        assert_eq!(ids(txn.select_output_events(&query).unwrap()), ["$e6", "$e4", "$e2"]);

        query.only_sync_visible = true;
        assert_eq!(ids(txn.select_output_events(&query).unwrap()), ["$e6", "$e2"]);

        query.order = ScanOrder::Ascending;
        query.limit = 1;
        assert_eq!(ids(txn.select_output_events(&query).unwrap()), ["$e2"]);

        query.low = StreamPosition(2);
        query.limit = 5;
        assert_eq!(ids(txn.select_output_events(&query).unwrap()), ["$e6"]);

        let state = txn
            .select_state_in_range(StreamPosition(0), StreamPosition(6), 10)
            .unwrap();
        assert_eq!(ids(state), ["$e2"]);
        assert!(txn
            .select_state_in_range(StreamPosition(2), StreamPosition(6), 10)
            .unwrap()
            .is_empty());

        assert_eq!(txn.select_max_position().unwrap(), StreamPosition(6));
        assert_eq!(
            txn.select_room_ids_in_range(StreamPosition(0), StreamPosition(6))
                .unwrap(),
            ["!even:x", "!odd:x"]
        );
        // Position 4 is the only row of the window and is hidden from sync.
        assert!(txn
            .select_room_ids_in_range(StreamPosition(3), StreamPosition(4))
            .unwrap()
            .is_empty());
        assert_eq!(
            txn.select_output_position("$e3").unwrap(),
            Some(StreamPosition(3))
        );
        let rows = txn
            .select_output_events_by_id(&["$e5".into(), "$e1".into()])
            .unwrap();
        assert_eq!(ids(rows), ["$e1", "$e5"]);
    }
}

#[test]
fn exclude_flag_upsert() {
    for store in engines() {
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        let mut row = output_row(1, "!r:x", "$back");
        row.exclude_from_sync = true;
        txn.insert_output_event(&row).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(&ctx).unwrap();
        txn.update_exclude_from_sync("$back", false).unwrap();
        assert!(txn.update_exclude_from_sync("$missing", false).is_err());
        txn.commit().unwrap();

        let txn = store.begin(&ctx).unwrap();
        let rows = txn.select_output_events_by_id(&["$back".into()]).unwrap();
        assert!(!rows[0].exclude_from_sync);
        assert_eq!(rows[0].position, StreamPosition(1));
    }
}

#[test]
fn stream_counter_survives_only_commits() {
    for store in engines() {
        let ctx = Context::background();
        let mut txn = store.begin(&ctx).unwrap();
        txn.next_stream_position(GLOBAL_STREAM).unwrap();
        txn.next_stream_position(GLOBAL_STREAM).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(&ctx).unwrap();
        assert_eq!(
            txn.next_stream_position(GLOBAL_STREAM).unwrap(),
            StreamPosition(3)
        );
        txn.rollback().unwrap();

        let mut txn = store.begin(&ctx).unwrap();
        assert_eq!(
            txn.next_stream_position(GLOBAL_STREAM).unwrap(),
            StreamPosition(3)
        );
        assert_eq!(txn.next_stream_position("other").unwrap(), StreamPosition(1));
    }
}
