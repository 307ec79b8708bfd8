//! Concurrent ingest helpers.
//!
//! Each worker thread owns a disjoint set of rooms, so every conflict the
//! store reports comes from shared rows such as the NID tables and is safe
//! to retry.

use crate::events::EventFactory;
use roomdb_event::{HeaderedEvent, RoomVersion};
use roomdb_roomserver::{InputRoomEvent, RoomServer, RoomServerResult, RoomUpdate};
use roomdb_storage::Context;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of an ingest run.
#[derive(Debug, Clone)]
pub struct IngestResult {
    /// Events applied.
    pub applied: usize,
    /// Attempts repeated after a retryable error.
    pub retried: usize,
    /// Events given up on.
    pub failed: usize,
    /// Wall time.
    pub duration: Duration,
}

impl IngestResult {
    /// Events applied per second.
    pub fn events_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.applied as f64 / secs
        } else {
            0.0
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Applied: {}", self.applied);
        println!("Retried: {}", self.retried);
        println!("Failed: {}", self.failed);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} events/sec", self.events_per_second());
    }
}

/// Configuration for an ingest run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Number of rooms.
    pub rooms: usize,
    /// Messages per room after the create and join events.
    pub events_per_room: usize,
    /// Worker threads.
    pub threads: usize,
    /// Attempts per event before giving up.
    pub max_attempts: usize,
    /// Room version of every room.
    pub version: RoomVersion,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rooms: 8,
            events_per_room: 50,
            threads: 4,
            max_attempts: 10,
            version: RoomVersion::V6,
        }
    }
}

/// Builds the linear history of one room: create, join, then messages.
pub fn room_history(room_id: &str, version: RoomVersion, messages: usize) -> Vec<HeaderedEvent> {
    let mut room = EventFactory::new(room_id, version);
    let sender = "@alice:test";
    let mut events = vec![room.create(sender), room.member(sender, "join")];
    events.extend((0..messages).map(|n| room.message(sender, &format!("message {n}"))));
    events
}

/// Applies one event, retrying while the error is retryable.
pub fn input_with_retry(
    server: &RoomServer,
    event: HeaderedEvent,
    max_attempts: usize,
    retried: &AtomicUsize,
) -> RoomServerResult<RoomUpdate> {
    let input = InputRoomEvent::new(event);
    let mut attempt = 1;
    loop {
        match server.input(&Context::background(), &input) {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                retried.fetch_add(1, Ordering::Relaxed);
                attempt += 1;
                thread::sleep(Duration::from_millis(attempt as u64));
            }
            other => return other,
        }
    }
}

/// Ingests `config.rooms` linear rooms from `config.threads` threads.
pub fn ingest_rooms_concurrently(server: &RoomServer, config: &IngestConfig) -> IngestResult {
    let applied = Arc::new(AtomicUsize::new(0));
    let retried = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let threads = config.threads.max(1);

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let server = server.clone();
            let config = config.clone();
            let applied = Arc::clone(&applied);
            let retried = Arc::clone(&retried);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                for r in (t..config.rooms).step_by(threads) {
                    let room_id = format!("!room{r}:test");
                    for event in room_history(&room_id, config.version, config.events_per_room) {
                        match input_with_retry(&server, event, config.max_attempts, &retried) {
                            Ok(RoomUpdate::Applied(_)) => applied.fetch_add(1, Ordering::Relaxed),
                            _ => failed.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("ingest thread panicked");
    }

    IngestResult {
        applied: applied.load(Ordering::Relaxed),
        retried: retried.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        duration: start.elapsed(),
    }
}
