//! Sync command implementation.

use crate::config::CliConfig;
use roomdb_storage::Context;
use roomdb_syncapi::{SyncRequest, SyncToken};
use std::time::Duration;

/// Runs the sync command. Never waits for new events.
pub fn run(
    config: &CliConfig,
    since: Option<&str>,
    limit: Option<usize>,
    session: Option<i64>,
    rooms: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, sync) = config.open()?;
    let request = SyncRequest {
        session_id: session,
        since: since.map(str::parse::<SyncToken>).transpose()?,
        timeline_limit: limit,
        timeout: Some(Duration::ZERO),
        rooms,
    };
    let response = sync.stream().incremental(&Context::background(), &request)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
