//! Ingest command implementation.

use crate::config::CliConfig;
use roomdb_event::HeaderedEvent;
use roomdb_roomserver::{InputRoomEvent, RoomUpdate};
use roomdb_storage::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

const MAX_ATTEMPTS: usize = 3;

/// Outcome of an ingest run.
#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    /// Event file.
    pub file: String,
    /// Events read.
    pub events: usize,
    /// Events applied.
    pub applied: usize,
    /// Events already stored.
    pub already_exists: usize,
    /// Events with unknown prev events.
    pub missing_prev_events: usize,
    /// Events rejected or unreadable.
    pub rejected: usize,
    /// Output log position of the last applied event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_position: Option<i64>,
    /// Wall time in milliseconds.
    pub elapsed_ms: u128,
}

/// Runs the ingest command.
pub fn run(
    config: &CliConfig,
    file: &Path,
    backfill: bool,
) -> Result<IngestSummary, Box<dyn std::error::Error>> {
    let (server, sync) = config.open()?;
    let reader = BufReader::new(File::open(file)?);
    let ctx = Context::background();
    let start = Instant::now();
    let mut summary = IngestSummary {
        file: file.display().to_string(),
        ..IngestSummary::default()
    };

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        summary.events += 1;

        let event = match HeaderedEvent::from_json(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = index + 1, error = %e, "unreadable event");
                summary.rejected += 1;
                continue;
            }
        };
        let input = if backfill {
            InputRoomEvent::backfill(event)
        } else {
            InputRoomEvent::new(event)
        };

        let mut attempt = 1;
        let update = loop {
            match server.input(&ctx, &input) {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => attempt += 1,
                other => break other,
            }
        };
        match update {
            Ok(RoomUpdate::Applied(output)) => {
                let position = sync.consumer().on_output(&ctx, &output)?;
                summary.applied += 1;
                summary.last_position = Some(position.as_i64());
            }
            Ok(RoomUpdate::AlreadyExists { .. }) => summary.already_exists += 1,
            Ok(RoomUpdate::MissingPrevEvents { missing }) => {
                warn!(line = index + 1, ?missing, "prev events unknown");
                summary.missing_prev_events += 1;
            }
            Err(e) => {
                warn!(line = index + 1, error = %e, "event rejected");
                summary.rejected += 1;
            }
        }
    }

    summary.elapsed_ms = start.elapsed().as_millis();
    info!(
        applied = summary.applied,
        rejected = summary.rejected,
        "ingest finished"
    );
    Ok(summary)
}

/// Prints a summary.
pub fn print(summary: &IngestSummary, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(summary)?),
        _ => {
            println!("Ingested {}", summary.file);
            println!("  events:              {}", summary.events);
            println!("  applied:             {}", summary.applied);
            println!("  already stored:      {}", summary.already_exists);
            println!("  missing prev events: {}", summary.missing_prev_events);
            println!("  rejected:            {}", summary.rejected);
            if let Some(position) = summary.last_position {
                println!("  last position:       {position}");
            }
            println!("  elapsed:             {} ms", summary.elapsed_ms);
        }
    }
    Ok(())
}
