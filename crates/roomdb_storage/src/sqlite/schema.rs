//! SQL DDL for the SQLite engine.

pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS roomserver_rooms (
    room_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL UNIQUE,
    latest_event_nids TEXT NOT NULL DEFAULT '[]',
    last_event_sent_nid INTEGER NOT NULL DEFAULT 0,
    state_snapshot_nid INTEGER NOT NULL DEFAULT 0,
    room_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS roomserver_event_types (
    event_type_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS roomserver_event_state_keys (
    event_state_key_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    event_state_key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS roomserver_events (
    event_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    room_nid INTEGER NOT NULL,
    event_type_nid INTEGER NOT NULL,
    event_state_key_nid INTEGER,
    event_id TEXT NOT NULL UNIQUE,
    depth INTEGER NOT NULL,
    prev_event_nids TEXT NOT NULL DEFAULT '[]',
    state_snapshot_nid INTEGER NOT NULL DEFAULT 0,
    event_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS roomserver_previous_events (
    previous_event_id TEXT NOT NULL,
    event_nid INTEGER NOT NULL,
    PRIMARY KEY (previous_event_id, event_nid)
);

CREATE TABLE IF NOT EXISTS roomserver_state_blocks (
    state_block_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    state_block_hash BLOB NOT NULL UNIQUE,
    entries TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS roomserver_state_snapshots (
    state_snapshot_nid INTEGER PRIMARY KEY AUTOINCREMENT,
    room_nid INTEGER NOT NULL,
    state_block_nids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS syncapi_output_room_events (
    id INTEGER PRIMARY KEY,
    event_id TEXT NOT NULL UNIQUE,
    room_id TEXT NOT NULL,
    headered_event_json TEXT NOT NULL,
    type TEXT NOT NULL,
    sender TEXT NOT NULL,
    contains_url BOOLEAN NOT NULL,
    add_state_ids TEXT,
    remove_state_ids TEXT,
    session_id INTEGER,
    transaction_id TEXT,
    exclude_from_sync BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS syncapi_output_room_events_room_id_idx
    ON syncapi_output_room_events(room_id, id);

CREATE TABLE IF NOT EXISTS syncapi_stream_id (
    stream_name TEXT NOT NULL PRIMARY KEY,
    stream_id INTEGER NOT NULL DEFAULT 0
);

INSERT INTO syncapi_stream_id (stream_name, stream_id) VALUES ('global', 0)
    ON CONFLICT DO NOTHING;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const SEED_EVENT_TYPE: &str = "INSERT INTO roomserver_event_types (event_type_nid, event_type) \
     VALUES (?1, ?2) ON CONFLICT DO NOTHING";

pub const SEED_EVENT_STATE_KEY: &str =
    "INSERT INTO roomserver_event_state_keys (event_state_key_nid, event_state_key) \
     VALUES (?1, ?2) ON CONFLICT DO NOTHING";
