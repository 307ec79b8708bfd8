//! Inspect command implementation.

use crate::config::CliConfig;
use roomdb_storage::{Context, StreamPosition};
use roomdb_syncapi::Range;
use serde::Serialize;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data source name.
    pub dsn: String,
    /// Storage engine.
    pub engine: &'static str,
    /// Highest output log position.
    pub max_position: i64,
    /// Rooms with logged events.
    pub rooms: Vec<RoomStats>,
}

/// Statistics for a single room.
#[derive(Debug, Serialize)]
pub struct RoomStats {
    /// Room ID.
    pub room_id: String,
    /// Room version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Number of forward extremities.
    pub extremities: usize,
    /// Number of state events.
    pub state_events: usize,
}

/// Gathers store statistics.
pub fn collect(config: &CliConfig) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let (server, sync) = config.open()?;
    let ctx = Context::background();
    let max = sync.log().select_max_event_id(&ctx)?;
    let room_ids = sync
        .log()
        .select_rooms_in_range(&ctx, Range::forward(StreamPosition::ZERO, max))?;

    let mut rooms = Vec::with_capacity(room_ids.len());
    for room_id in room_ids {
        let state = server.query().latest_events_and_state(&ctx, &room_id, &[])?;
        rooms.push(RoomStats {
            room_id,
            version: state.room_version.map(|v| v.to_string()),
            extremities: state.latest_event_ids.len(),
            state_events: state.state_events.len(),
        });
    }

    Ok(InspectResult {
        dsn: config.store.dsn.clone(),
        engine: server.store().engine(),
        max_position: max.as_i64(),
        rooms,
    })
}

/// Runs the inspect command.
pub fn run(config: &CliConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(config)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("roomdb Store Inspection");
    println!("=======================");
    println!();
    println!("DSN:    {}", result.dsn);
    println!("Engine: {}", result.engine);
    println!();
    println!("Output log:");
    println!("  Max position: {}", result.max_position);
    println!("  Rooms:        {}", result.rooms.len());

    if !result.rooms.is_empty() {
        println!();
        println!("Rooms:");
        for room in &result.rooms {
            println!(
                "  {} (v{}) {} extremities, {} state events",
                room.room_id,
                room.version.as_deref().unwrap_or("?"),
                room.extremities,
                room.state_events
            );
        }
    }
}
