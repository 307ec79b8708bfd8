//! roomdb CLI
//!
//! Command-line tools for a roomdb store.
//!
//! # Commands
//!
//! - `ingest` - Feed a file of events through the room server
//! - `state` - Show the extremities and current state of a room
//! - `log` - Page through a room's output log
//! - `sync` - Run an incremental sync against the output log
//! - `inspect` - Summarize the store

mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// roomdb command-line tools.
#[derive(Parser)]
#[command(name = "roomdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Data source name, overriding the configuration file
    #[arg(global = true, short, long)]
    dsn: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed newline-delimited headered events through the room server
    Ingest {
        /// Event file, one JSON event per line
        file: PathBuf,

        /// Input the events as backfilled history
        #[arg(short, long)]
        backfill: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the extremities and current state of a room
    State {
        /// Room ID
        room_id: String,

        /// Only these slots, as `type` or `type/state_key`
        #[arg(short, long)]
        slot: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Page through a room's output log
    Log {
        /// Room ID. Without one, the rooms with logged events are listed
        room_id: Option<String>,

        /// Start after this position
        #[arg(long, default_value = "0")]
        from: i64,

        /// Newest first, starting at `--from` (0 means the end of the log)
        #[arg(short, long)]
        backwards: bool,

        /// Maximum number of events
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run an incremental sync and print the response as JSON
    Sync {
        /// Sync token from a previous response, e.g. `s42`
        #[arg(short, long)]
        since: Option<String>,

        /// Timeline events per room
        #[arg(short, long)]
        limit: Option<usize>,

        /// Session of the requesting device
        #[arg(long)]
        session: Option<i64>,

        /// Only these rooms
        #[arg(short, long)]
        room: Vec<String>,
    },

    /// Summarize the store
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };
    if let Some(dsn) = cli.dsn {
        config.store.dsn = dsn;
    }

    match cli.command {
        Commands::Ingest {
            file,
            backfill,
            format,
        } => {
            let summary = commands::ingest::run(&config, &file, backfill)?;
            commands::ingest::print(&summary, &format)?;
        }
        Commands::State {
            room_id,
            slot,
            format,
        } => {
            commands::state::run(&config, &room_id, &slot, &format)?;
        }
        Commands::Log {
            room_id,
            from,
            backwards,
            limit,
            format,
        } => {
            commands::log::run(&config, room_id.as_deref(), from, backwards, limit, &format)?;
        }
        Commands::Sync {
            since,
            limit,
            session,
            room,
        } => {
            commands::sync::run(&config, since.as_deref(), limit, session, room)?;
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&config, &format)?;
        }
        Commands::Version => {
            println!("roomdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "room versions: {}",
                roomdb_event::RoomVersion::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    Ok(())
}
