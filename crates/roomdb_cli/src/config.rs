//! Configuration file loading.

use roomdb_roomserver::{RoomServer, RoomServerConfig};
use roomdb_storage::{open_store, StorageError, Store, StoreConfig};
use roomdb_syncapi::{SyncApi, SyncConfig, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while loading configuration or opening the store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`CliConfig`].
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The store could not be opened.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The sync API could not be wired.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Everything the CLI can be configured with.
///
/// ```json
/// {
///   "store": { "dsn": "file:/var/lib/roomdb/roomdb.sqlite" },
///   "roomserver": { "max_state_blocks_per_snapshot": 32 },
///   "sync": { "default_timeline_limit": 10 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Store settings.
    pub store: StoreConfig,
    /// Room server settings.
    pub roomserver: RoomServerConfig,
    /// Sync settings.
    pub sync: SyncConfig,
}

impl CliConfig {
    /// Reads a JSON configuration file. Missing sections take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Opens the configured store.
    pub fn open_store(&self) -> Result<Arc<dyn Store>, ConfigError> {
        if self.store.dsn.trim() == "memory:" {
            warn!("using the memory engine; nothing outlives this process");
        }
        Ok(open_store(&self.store)?)
    }

    /// Opens the store and wires the room server and sync API over it.
    pub fn open(&self) -> Result<(RoomServer, SyncApi), ConfigError> {
        let store = self.open_store()?;
        let server = RoomServer::new(Arc::clone(&store), self.roomserver.clone());
        let sync = SyncApi::new(store, self.sync.clone())?;
        Ok((server, sync))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roomdb.json");
        std::fs::write(
            &path,
            r#"{"store": {"dsn": "sqlite::memory:"}, "sync": {"max_timeline_limit": 5}}"#,
        )
        .unwrap();

        let config = CliConfig::load(&path).unwrap();
        assert_eq!(config.store.dsn, "sqlite::memory:");
        assert_eq!(config.sync.max_timeline_limit, 5);
        assert_eq!(config.sync.default_timeline_limit, 20);
        assert_eq!(config.roomserver, RoomServerConfig::default());
    }

    #[test]
    fn bad_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            CliConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(
            CliConfig::load(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }
}
