//! State command implementation.

use crate::config::CliConfig;
use roomdb_event::StateKeyTuple;
use roomdb_roomserver::LatestEventsAndState;
use roomdb_storage::Context;

/// Parses `type` or `type/state_key` into a state slot.
pub fn parse_slot(slot: &str) -> StateKeyTuple {
    match slot.split_once('/') {
        Some((event_type, state_key)) => StateKeyTuple::new(event_type, state_key),
        None => StateKeyTuple::new(slot, ""),
    }
}

/// Reads the extremities and state of a room.
pub fn collect(
    config: &CliConfig,
    room_id: &str,
    slots: &[String],
) -> Result<LatestEventsAndState, Box<dyn std::error::Error>> {
    let (server, _) = config.open()?;
    let tuples: Vec<StateKeyTuple> = slots.iter().map(|s| parse_slot(s)).collect();
    Ok(server
        .query()
        .latest_events_and_state(&Context::background(), room_id, &tuples)?)
}

/// Runs the state command.
pub fn run(
    config: &CliConfig,
    room_id: &str,
    slots: &[String],
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = collect(config, room_id, slots)?;
    if !state.room_exists {
        return Err(format!("room {room_id} not found").into());
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&state)?),
        _ => {
            println!("Room {room_id}");
            if let Some(version) = state.room_version {
                println!("  version: {version}");
            }
            println!("  extremities:");
            for id in &state.latest_event_ids {
                println!("    {id}");
            }
            println!("  state ({} events):", state.state_events.len());
            for event in &state.state_events {
                println!(
                    "    {} {:?} {} {}",
                    event.event_type,
                    event.state_key.as_deref().unwrap_or_default(),
                    event.sender,
                    event.event_id()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ingest;
    use crate::commands::testing::{sqlite_config, write_room};
    use tempfile::TempDir;

    #[test]
    fn slots() {
        assert_eq!(parse_slot("m.room.name"), StateKeyTuple::new("m.room.name", ""));
        assert_eq!(
            parse_slot("m.room.member/@alice:test"),
            StateKeyTuple::new("m.room.member", "@alice:test")
        );
    }

    #[test]
    fn state_of_an_ingested_room() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);
        ingest::run(&config, &write_room(&dir), false).unwrap();

        let all = collect(&config, "!cli:test", &[]).unwrap();
        assert!(all.room_exists);
        assert_eq!(all.latest_event_ids.len(), 1);
        assert_eq!(all.state_events.len(), 3);

        let name = collect(&config, "!cli:test", &["m.room.name".to_string()]).unwrap();
        assert_eq!(name.state_events.len(), 1);
        assert_eq!(name.state_events[0].content["name"], "CLI");

        assert!(!collect(&config, "!nope:test", &[]).unwrap().room_exists);
    }
}
