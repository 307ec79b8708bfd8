//! Sync API configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Timeline events per room when the request names no limit.
    pub default_timeline_limit: usize,

    /// Upper bound on a requested timeline limit.
    pub max_timeline_limit: usize,

    /// Maximum state-carrying rows scanned per sync.
    pub state_filter_limit: usize,

    /// Longest a sync waits for new events, in milliseconds.
    pub long_poll_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_timeline_limit: 20,
            max_timeline_limit: 100,
            state_filter_limit: 1_000,
            long_poll_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default timeline limit.
    pub fn default_timeline_limit(mut self, limit: usize) -> Self {
        self.default_timeline_limit = limit;
        self
    }

    /// Sets the timeline limit cap.
    pub fn max_timeline_limit(mut self, limit: usize) -> Self {
        self.max_timeline_limit = limit;
        self
    }

    /// Sets the state scan limit.
    pub fn state_filter_limit(mut self, limit: usize) -> Self {
        self.state_filter_limit = limit;
        self
    }

    /// Sets the long-poll bound.
    pub fn long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the long-poll bound.
    pub fn long_poll_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    /// Clamps a requested timeline limit to `1..=max_timeline_limit`.
    pub fn timeline_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_timeline_limit)
            .clamp(1, self.max_timeline_limit.max(1))
    }
}
