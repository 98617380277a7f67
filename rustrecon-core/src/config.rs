use std::time::Duration;

use rustrecon_types::{is_stub_mac, normalize_mac};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Tunables for the scheduler and the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between scheduler ticks, and after a failed tick.
    pub tick_interval_secs: u64,
    /// Number of concurrent workers pulling from the queue.
    pub workers: usize,
    /// Dispatch timeout for actions without their own.
    pub default_timeout_secs: u64,
    /// Re-enqueue failed attempts that still have retries left.
    pub retry_failed: bool,
    /// Let triggers queue an action again after it already succeeded.
    pub retry_success: bool,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Target MAC for global actions. Must be a real MAC.
    pub controller_mac: Option<String>,
    /// Age after which finished queue rows are deleted.
    pub purge_after_secs: u64,
    /// Minimum spacing between live stats recomputations.
    pub stats_refresh_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            workers: 2,
            default_timeout_secs: 300,
            retry_failed: true,
            retry_success: false,
            backoff_base_secs: 60,
            backoff_cap_secs: 900,
            controller_mac: None,
            purge_after_secs: 7 * 24 * 3600,
            stats_refresh_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Slack the stale-running sweep adds to a row's timeout before expiring it:
    /// one tick, plus one second for whole-second `started_at` stamps.
    pub fn stale_grace_secs(&self) -> u64 {
        self.tick_interval_secs.saturating_add(1)
    }

    pub fn stats_refresh(&self) -> Duration {
        Duration::from_secs(self.stats_refresh_secs)
    }

    /// Normalized controller MAC, or a config error if it is missing or a stub.
    pub fn controller_mac(&self) -> Result<String, OrchestratorError> {
        let Some(raw) = self.controller_mac.as_deref() else {
            return Err(OrchestratorError::Config(
                "controller_mac is required for global actions".into(),
            ));
        };
        let mac = normalize_mac(raw);
        if mac.is_empty() {
            return Err(OrchestratorError::Config("controller_mac is empty".into()));
        }
        if is_stub_mac(&mac) {
            return Err(OrchestratorError::Config(format!(
                "controller_mac {mac} is an IP placeholder, not a MAC"
            )));
        }
        Ok(mac)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.workers == 0 {
            return Err(OrchestratorError::Config("workers must be at least 1".into()));
        }
        if self.tick_interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "tick_interval_secs must be positive".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "default_timeout_secs must be positive".into(),
            ));
        }
        if self.backoff_base_secs == 0 || self.backoff_cap_secs < self.backoff_base_secs {
            return Err(OrchestratorError::Config(format!(
                "backoff {}s..{}s is not a valid range",
                self.backoff_base_secs, self.backoff_cap_secs
            )));
        }
        self.controller_mac()?;
        Ok(())
    }
}
