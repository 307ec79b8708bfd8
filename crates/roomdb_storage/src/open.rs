//! Engine selection by data source name.

use crate::error::{StorageError, StorageResult};
use crate::memory::MemoryStore;
use crate::tables::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Store configuration.
///
/// Recognised data source names:
/// - `memory:` for the in-memory engine
/// - `sqlite::memory:` for a private in-memory SQLite database
/// - `file:<path>` or a bare path for a SQLite database file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data source name.
    pub dsn: String,
    /// Upper bound on lock waits in milliseconds. `None` waits as long as
    /// the caller's context allows.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: "memory:".to_string(),
            lock_timeout_ms: Some(30_000),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for `dsn` with default settings.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Self::default()
        }
    }

    /// Sets the lock wait bound.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Returns the lock wait bound.
    #[must_use]
    pub fn lock_timeout_duration(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Opens the engine named by `config.dsn`.
pub fn open_store(config: &StoreConfig) -> StorageResult<Arc<dyn Store>> {
    let dsn = config.dsn.trim();
    let lock_timeout = config.lock_timeout_duration();

    if dsn == "memory:" {
        info!("opening memory store");
        return Ok(Arc::new(MemoryStore::with_lock_timeout(lock_timeout)));
    }
    open_sqlite(dsn, lock_timeout)
}

#[cfg(feature = "sqlite")]
fn open_sqlite(dsn: &str, lock_timeout: Option<Duration>) -> StorageResult<Arc<dyn Store>> {
    use crate::sqlite::SqliteStore;
    use std::path::Path;

    if dsn == "sqlite::memory:" {
        return Ok(Arc::new(
            SqliteStore::open_in_memory()?.with_lock_timeout(lock_timeout),
        ));
    }
    let path = match dsn.strip_prefix("file:") {
        Some(path) => path,
        None if dsn.contains("://") || dsn.is_empty() => {
            return Err(StorageError::UnsupportedEngine {
                dsn: dsn.to_string(),
            })
        }
        None => dsn,
    };
    Ok(Arc::new(
        SqliteStore::open(Path::new(path))?.with_lock_timeout(lock_timeout),
    ))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(dsn: &str, _lock_timeout: Option<Duration>) -> StorageResult<Arc<dyn Store>> {
    Err(StorageError::UnsupportedEngine {
        dsn: dsn.to_string(),
    })
}
