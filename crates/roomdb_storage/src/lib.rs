//! # roomdb Storage
//!
//! Transactional table interface and storage engines for roomdb.
//!
//! The room server and the sync API only ever talk to a [`Txn`]: a
//! transaction implementing every table trait. Engines provide
//! [`Store::begin`]:
//!
//! - [`MemoryStore`]: committed tables behind a lock plus a per-transaction
//!   overlay. Used by tests and ephemeral deployments.
//! - [`SqliteStore`]: an embedded SQLite database (feature `sqlite`).
//!
//! Pick one at runtime with [`open_store`].
//!
//! ## Guarantees
//!
//! - Writes of a transaction become visible together at commit or not at all
//! - `select_latest_events_for_update` and `next_stream_position` hold their
//!   row lock until the transaction ends
//! - Every operation checks the transaction's [`Context`]

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Library code propagates errors instead of panicking.
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod context;
mod error;
mod memory;
mod open;
#[cfg(feature = "sqlite")]
mod sqlite;
mod tables;
mod types;

pub use context::Context;
pub use error::{ErrorKind, StorageError, StorageResult};
pub use memory::MemoryStore;
pub use open::{open_store, StoreConfig};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use tables::{
    EventsTable, NidTable, OutputRoomEventsTable, PreviousEventsTable, RoomsTable,
    StateBlocksTable, StateSnapshotsTable, Store, StreamIdTable, Txn,
};
pub use types::{
    normalize_entries, state_block_hash, EventNid, EventRow, EventStateKeyNid, EventTypeNid,
    LatestEvents, NewEvent, NidKind, OutputEventRow, OutputEventsQuery, RoomInfo, RoomNid,
    ScanOrder, StateBlockNid, StateBlockNidList, StateEntry, StateEntryList, StateKey,
    StateSnapshotNid, StreamPosition, GLOBAL_STREAM, PREASSIGNED_EVENT_TYPES,
    PREASSIGNED_STATE_KEYS,
};
