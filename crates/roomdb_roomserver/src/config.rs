//! Room server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the room server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomServerConfig {
    /// Once a snapshot would be layered on more blocks than this, a single
    /// block holding the full state is written instead.
    pub max_state_blocks_per_snapshot: usize,

    /// Upper bound in milliseconds on one event's transaction, lock waits
    /// included.
    pub lock_timeout_ms: u64,

    /// Number of published outputs the in-process feed keeps for polling.
    pub output_history: usize,
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            max_state_blocks_per_snapshot: 64,
            lock_timeout_ms: 30_000,
            output_history: 10_000,
        }
    }
}

impl RoomServerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block count that triggers a full-state block.
    #[must_use]
    pub const fn max_state_blocks_per_snapshot(mut self, blocks: usize) -> Self {
        self.max_state_blocks_per_snapshot = blocks;
        self
    }

    /// Sets the transaction time bound.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the feed history size.
    #[must_use]
    pub const fn output_history(mut self, entries: usize) -> Self {
        self.output_history = entries;
        self
    }

    /// Returns the transaction time bound.
    #[must_use]
    pub const fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RoomServerConfig::default();
        assert_eq!(config.max_state_blocks_per_snapshot, 64);
        assert_eq!(config.lock_timeout_duration(), Duration::from_secs(30));
    }

    #[test]
    fn builder_pattern() {
        let config = RoomServerConfig::new()
            .max_state_blocks_per_snapshot(4)
            .lock_timeout(Duration::from_millis(250))
            .output_history(16);
        assert_eq!(config.max_state_blocks_per_snapshot, 4);
        assert_eq!(config.lock_timeout_ms, 250);
        assert_eq!(config.output_history, 16);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: RoomServerConfig =
            serde_json::from_str(r#"{"max_state_blocks_per_snapshot": 8}"#).unwrap();
        assert_eq!(config.max_state_blocks_per_snapshot, 8);
        assert_eq!(config.output_history, 10_000);
    }
}
