//! Log command implementation.

use crate::config::CliConfig;
use roomdb_storage::{Context, StreamPosition};
use roomdb_syncapi::{ClientEvent, Range, SyncToken};
use serde::Serialize;

/// A page of the output log, or the rooms in it when no room was named.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LogListing {
    /// Events of one room.
    Events {
        /// Room ID.
        room_id: String,
        /// Events in the order paged.
        events: Vec<ClientEvent>,
        /// Position to continue from.
        #[serde(skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
    },
    /// Rooms with sync-visible events.
    Rooms {
        /// Highest position in the log.
        max_position: i64,
        /// Room IDs.
        rooms: Vec<String>,
    },
}

/// Reads a page of the log.
pub fn collect(
    config: &CliConfig,
    room_id: Option<&str>,
    from: i64,
    backwards: bool,
    limit: Option<usize>,
) -> Result<LogListing, Box<dyn std::error::Error>> {
    let (_, sync) = config.open()?;
    let ctx = Context::background();
    let max = sync.log().select_max_event_id(&ctx)?;

    let Some(room_id) = room_id else {
        let rooms = sync
            .log()
            .select_rooms_in_range(&ctx, Range::forward(StreamPosition(from.max(0)), max))?;
        return Ok(LogListing::Rooms {
            max_position: max.as_i64(),
            rooms,
        });
    };

    let from = if backwards && from <= 0 {
        max
    } else {
        StreamPosition(from.max(0))
    };
    let page = sync
        .stream()
        .messages(&ctx, room_id, SyncToken(from), backwards, limit)?;
    Ok(LogListing::Events {
        room_id: room_id.to_string(),
        events: page.chunk,
        next: page.end.map(|t| t.position().as_i64()),
    })
}

/// Runs the log command.
pub fn run(
    config: &CliConfig,
    room_id: Option<&str>,
    from: i64,
    backwards: bool,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let listing = collect(config, room_id, from, backwards, limit)?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    match listing {
        LogListing::Rooms {
            max_position,
            rooms,
        } => {
            println!("Output log up to position {max_position}");
            for room in rooms {
                println!("  {room}");
            }
        }
        LogListing::Events {
            room_id,
            events,
            next,
        } => {
            println!("Output log of {room_id}");
            for e in &events {
                println!(
                    "  {:>8}  {:<24} {:<24} {}",
                    e.position.as_i64(),
                    e.event.event_type,
                    e.event.sender,
                    e.event.event_id()
                );
            }
            if let Some(next) = next {
                println!("  more from --from {next}");
            }
        }
    }
    Ok(())
}
