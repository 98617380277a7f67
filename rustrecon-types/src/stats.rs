use serde::{Deserialize, Serialize};

/// Counters persisted in the singleton stats row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStats {
    pub total_open_ports: u64,
    pub alive_hosts_count: u64,
    pub all_known_hosts_count: u64,
    pub vulnerabilities_count: u64,
}

/// Everything a dashboard shows, read through the stats cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayStats {
    #[serde(flatten)]
    pub live: LiveStats,
    pub credentials_count: u64,
    pub actions_count: u64,
    pub zombie_count: u64,
    pub pending_count: u64,
    pub running_count: u64,
    pub scheduled_count: u64,
    pub updated_at: i64,
}
