//! Store fixtures.
//!
//! Every fixture owns whatever it needs on disk and removes it on drop.

use roomdb_roomserver::{RoomServer, RoomServerConfig};
use roomdb_storage::{MemoryStore, SqliteStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A store with automatic cleanup.
pub struct TestStore {
    /// The store.
    pub store: Arc<dyn Store>,
    /// Kept alive so the database file outlives the store.
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// An in-memory store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            _temp_dir: None,
        }
    }

    /// A SQLite store in a temporary directory.
    pub fn sqlite() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = SqliteStore::open(&temp_dir.path().join("roomdb.sqlite"))
            .expect("Failed to open SQLite store");
        Self {
            store: Arc::new(store),
            _temp_dir: Some(temp_dir),
        }
    }

    /// One fixture per engine.
    pub fn all() -> Vec<Self> {
        vec![Self::memory(), Self::sqlite()]
    }

    /// Returns the database file if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("roomdb.sqlite"))
    }

    /// Returns the engine name.
    pub fn engine(&self) -> &'static str {
        self.store.engine()
    }

    /// A room server over this store with the default configuration.
    pub fn room_server(&self) -> RoomServer {
        self.room_server_with(RoomServerConfig::default())
    }

    /// A room server over this store.
    pub fn room_server_with(&self, config: RoomServerConfig) -> RoomServer {
        RoomServer::new(Arc::clone(&self.store), config)
    }
}

impl std::ops::Deref for TestStore {
    type Target = Arc<dyn Store>;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test once against every engine.
///
/// # Example
///
/// ```
/// use roomdb_testkit::with_each_store;
///
/// with_each_store(|store| {
///     assert!(!store.engine().is_empty());
/// });
/// ```
pub fn with_each_store<F>(mut f: F)
where
    F: FnMut(&TestStore),
{
    for fixture in TestStore::all() {
        f(&fixture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engines_are_distinct() {
        let engines: Vec<_> = TestStore::all().iter().map(TestStore::engine).collect();
        assert_eq!(engines, vec!["memory", "sqlite"]);
    }

    #[test]
    fn sqlite_fixture_has_a_path() {
        let fixture = TestStore::sqlite();
        assert!(fixture.path().unwrap().exists());
        assert!(TestStore::memory().path().is_none());
    }
}
