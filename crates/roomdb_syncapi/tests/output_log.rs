//! Output log ordering and state folding across engines.

use proptest::prelude::*;
use roomdb_event::{HeaderedEvent, RoomVersion};
use roomdb_roomserver::InputRoomEvent;
use roomdb_storage::Context;
use roomdb_syncapi::{OutputLog, Range, StreamPosition};
use roomdb_testkit::{
    fold_linear_state, linear_history_strategy, room_version_strategy, with_each_store,
    EventFactory, HistoryStep, TestStore, USERS,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn messages(room_id: &str, count: usize) -> Vec<HeaderedEvent> {
    let mut room = EventFactory::new(room_id, RoomVersion::V2);
    let mut events = vec![room.create(USERS[0])];
    events.extend((1..count).map(|n| room.message(USERS[n % USERS.len()], &format!("m{n}"))));
    events
}

#[test]
fn concurrent_appends_partition_the_positions() {
    with_each_store(|fixture| {
        let log = OutputLog::new(Arc::clone(&fixture.store));
        let threads = 4;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let log = log.clone();
                thread::spawn(move || {
                    let ctx = Context::background();
                    messages(&format!("!r{t}:test"), per_thread)
                        .iter()
                        .map(|e| log.append_event(&ctx, e, &[], &[], None, false).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut positions: Vec<i64> = Vec::new();
        for handle in handles {
            let mine = handle.join().unwrap();
            // Each writer sees its own appends in increasing order.
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
            positions.extend(mine.iter().map(|p| p.as_i64()));
        }
        positions.sort_unstable();
        let total = (threads * per_thread) as i64;
        assert_eq!(positions, (1..=total).collect::<Vec<_>>());
        assert_eq!(
            log.select_max_event_id(&Context::background()).unwrap(),
            StreamPosition(total)
        );
    });
}

#[test]
fn concurrent_reappends_of_one_event_share_a_position() {
    let fixture = TestStore::memory();
    let log = OutputLog::new(Arc::clone(&fixture.store));
    let event = messages("!r:test", 1).remove(0);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let log = log.clone();
            let event = event.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                loop {
                    match log.append_event(&ctx, &event, &[], &[], None, false) {
                        Ok(position) => return position,
                        Err(e) if e.is_retryable() => continue,
                        Err(e) => panic!("append failed: {e}"),
                    }
                }
            })
        })
        .collect();
    let positions: BTreeSet<StreamPosition> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(positions.len(), 1);
}

fn build(version: RoomVersion, steps: &[HistoryStep]) -> Vec<HeaderedEvent> {
    let mut room = EventFactory::new("!fold:test", version);
    let mut events = vec![room.create(USERS[0])];
    events.extend(steps.iter().map(|step| step.build(&mut room)));
    events
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn state_in_range_over_the_whole_log_is_the_room_state(
        version in room_version_strategy(),
        steps in linear_history_strategy(30),
    ) {
        let fixture = TestStore::memory();
        let server = fixture.room_server();
        let log = OutputLog::new(Arc::clone(&fixture.store));
        let ctx = Context::background();

        let events = build(version, &steps);
        for event in &events {
            let update = server.input(&ctx, &InputRoomEvent::new(event.clone())).unwrap();
            let output = update.applied().unwrap();
            log.append_output(&ctx, output).unwrap();
        }

        let high = log.select_max_event_id(&ctx).unwrap();
        prop_assert_eq!(high.as_i64(), events.len() as i64);
        let state = log
            .select_state_in_range(&ctx, Range::forward(StreamPosition::ZERO, high), 10_000)
            .unwrap();
        let needed: BTreeSet<String> = state.needed["!fold:test"].iter().cloned().collect();
        let folded: BTreeSet<String> = fold_linear_state(&events).into_values().collect();
        prop_assert_eq!(needed, folded);
    }

    #[test]
    fn recent_then_early_reads_partition_the_log(
        excluded in proptest::collection::vec(any::<bool>(), 1..20),
        split in any::<prop::sample::Index>(),
    ) {
        for fixture in TestStore::all() {
            let log = OutputLog::new(Arc::clone(&fixture.store));
            let ctx = Context::background();
            let events = messages("!p:test", excluded.len());
            for (event, exclude) in events.iter().zip(&excluded) {
                log.append_event(&ctx, event, &[], &[], None, *exclude).unwrap();
            }

            let n = events.len() as i64;
            let split = StreamPosition(split.index(events.len() + 1) as i64);
            let end = StreamPosition(n);
            let limit = events.len();
            for only_sync_visible in [false, true] {
                let positions: Vec<i64> = log
                    .select_recent_events(&ctx, "!p:test", Range::forward(StreamPosition::ZERO, split), limit, true, only_sync_visible)
                    .unwrap()
                    .into_iter()
                    .chain(
                        log.select_early_events(&ctx, "!p:test", Range::forward(split, end), limit, only_sync_visible)
                            .unwrap(),
                    )
                    .map(|e| e.position.as_i64())
                    .collect();
                let expected: Vec<i64> = (1..=n)
                    .filter(|p| !(only_sync_visible && excluded[(*p - 1) as usize]))
                    .collect();
                prop_assert_eq!(positions, expected);
            }
        }
    }
}
