//! SQLite engine.
//!
//! One connection behind a mutex. A transaction owns the connection guard
//! for its whole lifetime and runs under `BEGIN IMMEDIATE`, so the database
//! write lock stands in for row locks.

mod rows;
mod schema;
mod txn;

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::tables::{Store, Txn};
use crate::types::NidKind;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use txn::SqliteTxn;

/// A SQLite-backed store.
///
/// Clones share the connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    lock_timeout: Option<Duration>,
}

impl SqliteStore {
    /// Opens or creates a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_owned()),
            lock_timeout: None,
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            lock_timeout: None,
        })
    }

    /// Bounds how long `begin` waits for the connection.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Returns the database file, or `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StorageError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StorageError::Database(format!("schema: {e}")))?;

        for (event_type, nid) in NidKind::EventType.preassigned() {
            conn.execute(schema::SEED_EVENT_TYPE, rusqlite::params![nid, event_type])?;
        }
        for (state_key, nid) in NidKind::EventStateKey.preassigned() {
            conn.execute(schema::SEED_EVENT_STATE_KEY, rusqlite::params![nid, state_key])?;
        }

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )?;
        }
        debug!(version = schema::SCHEMA_VERSION, "sqlite schema ready");
        Ok(())
    }
}

impl Store for SqliteStore {
    fn begin<'a>(&'a self, ctx: &Context) -> StorageResult<Box<dyn Txn + 'a>> {
        ctx.check()?;
        let conn = match ctx.lock_budget(self.lock_timeout) {
            None => self.conn.lock_arc(),
            Some(budget) => self.conn.try_lock_arc_for(budget).ok_or_else(|| {
                StorageError::conflict("timed out waiting for the database connection")
            })?,
        };
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTxn::new(conn, ctx.clone())))
    }

    fn engine(&self) -> &'static str {
        "sqlite"
    }
}
