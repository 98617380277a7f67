use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::Store`] handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite `busy_timeout` applied to the connection, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Extra attempts for a write transaction that still sees `SQLITE_BUSY`.
    pub busy_retries: u32,
    /// Lifetime of cached display stats, in seconds.
    pub stats_ttl_secs: u64,
    /// Age after which terminal queue rows are purged, in seconds.
    pub purge_after_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            busy_retries: 8,
            stats_ttl_secs: 5,
            purge_after_secs: 7 * 24 * 3600,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }
}
