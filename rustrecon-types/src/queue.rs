use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seconds of waiting that earn one point of priority.
pub const AGING_STEP_SECS: i64 = 300;

/// Ceiling for both base and effective priority.
pub const MAX_PRIORITY: i32 = 100;

/// Base priority used by immediate enqueues when the caller has no opinion.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Base priority used by deferred enqueues when the caller has no opinion.
pub const DEFAULT_SCHEDULED_PRIORITY: i32 = 40;

/// Retry budget of a new queue row when neither caller nor catalog sets one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a queue row.
///
/// Rows move `scheduled -> pending -> running -> {success, failed, expired,
/// cancelled}`. Failure-class rows may later be reclassified as `superseded`
/// once a newer attempt for the same target succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Scheduled,
    Pending,
    Running,
    Success,
    Failed,
    Expired,
    Cancelled,
    Superseded,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 8] = [
        QueueStatus::Scheduled,
        QueueStatus::Pending,
        QueueStatus::Running,
        QueueStatus::Success,
        QueueStatus::Failed,
        QueueStatus::Expired,
        QueueStatus::Cancelled,
        QueueStatus::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Scheduled => "scheduled",
            QueueStatus::Pending => "pending",
            QueueStatus::Running => "running",
            QueueStatus::Success => "success",
            QueueStatus::Failed => "failed",
            QueueStatus::Expired => "expired",
            QueueStatus::Cancelled => "cancelled",
            QueueStatus::Superseded => "superseded",
        }
    }

    /// Waiting or executing work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            QueueStatus::Scheduled | QueueStatus::Pending | QueueStatus::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Outcomes that consume a retry.
    pub fn is_failure(&self) -> bool {
        matches!(self, QueueStatus::Failed | QueueStatus::Expired)
    }

    /// Whether a row in `self` may move to `next`.
    ///
    /// A failure-class row may be reported failed again (a late duplicate
    /// report from the same worker); that still counts toward its retries.
    /// Reclassification to `superseded` happens only through supersession
    /// and is allowed here so that path can share the check.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        match (self, next) {
            (Scheduled, Pending | Cancelled) => true,
            (Pending, Running | Cancelled | Expired) => true,
            (Running, Success | Failed | Expired | Cancelled) => true,
            (Failed | Expired, Failed | Expired | Superseded) => true,
            _ => false,
        }
    }

    /// Position used when listing the whole queue: live work first.
    pub fn list_rank(&self) -> u8 {
        match self {
            QueueStatus::Running => 0,
            QueueStatus::Pending => 1,
            QueueStatus::Scheduled => 2,
            QueueStatus::Failed => 3,
            QueueStatus::Success => 4,
            QueueStatus::Expired => 5,
            QueueStatus::Cancelled => 6,
            QueueStatus::Superseded => 7,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown queue status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for QueueStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        QueueStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == lowered)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Base priority plus one point per [`AGING_STEP_SECS`] waited, capped at [`MAX_PRIORITY`].
pub fn effective_priority(priority: i32, age_secs: i64) -> i32 {
    let bonus = age_secs.max(0) / AGING_STEP_SECS;
    (i64::from(priority) + bonus).min(i64::from(MAX_PRIORITY)) as i32
}

/// One scheduled or historical attempt of an action against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub action_name: String,
    pub mac_address: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub service: Option<String>,
    pub priority: i32,
    /// Computed at read time from `priority` and `created_at`.
    pub priority_effective: i32,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub scheduled_for: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub trigger_source: Option<String>,
    pub dependencies: Option<String>,
    pub conditions: Option<String>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl QueueItem {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            action_name: self.action_name.clone(),
            mac_address: self.mac_address.clone(),
            port: self.port,
            service: self.service.clone(),
        }
    }

    /// Whether another failure may still be retried.
    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Per-item timeout carried in `metadata.timeout`, in seconds.
    pub fn metadata_timeout(&self) -> Option<u64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("timeout"))
            .and_then(|v| v.as_u64())
    }
}

/// Identifies one schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub action_name: String,
    pub mac_address: String,
    pub port: Option<u16>,
    pub service: Option<String>,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.action_name, self.mac_address)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(service) = &self.service {
            write!(f, "/{service}")?;
        }
        Ok(())
    }
}

/// Insert request for a queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub action_name: String,
    pub mac_address: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub service: Option<String>,
    pub priority: i32,
    pub status: QueueStatus,
    pub scheduled_for: Option<i64>,
    pub expires_at: Option<i64>,
    pub trigger_source: Option<String>,
    pub dependencies: Option<String>,
    pub conditions: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl NewQueueItem {
    /// A pending request with default priority.
    pub fn immediate(action_name: &str, mac_address: &str, ip: Option<&str>) -> Self {
        Self {
            action_name: action_name.to_string(),
            mac_address: mac_address.to_string(),
            ip: ip.map(str::to_string),
            port: None,
            hostname: None,
            service: None,
            priority: DEFAULT_PRIORITY,
            status: QueueStatus::Pending,
            scheduled_for: None,
            expires_at: None,
            trigger_source: None,
            dependencies: None,
            conditions: None,
            tags: Vec::new(),
            metadata: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// A scheduled request due at `run_at`, triggered by the scheduler.
    pub fn scheduled(action_name: &str, mac_address: &str, ip: Option<&str>, run_at: i64) -> Self {
        Self {
            priority: DEFAULT_SCHEDULED_PRIORITY,
            status: QueueStatus::Scheduled,
            scheduled_for: Some(run_at),
            trigger_source: Some("scheduler".to_string()),
            ..Self::immediate(action_name, mac_address, ip)
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn maybe_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn trigger(mut self, trigger: &str) -> Self {
        self.trigger_source = Some(trigger.to_string());
        self
    }

    pub fn expires_at(mut self, at: i64) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            action_name: self.action_name.clone(),
            mac_address: self.mac_address.clone(),
            port: self.port,
            service: self.service.clone(),
        }
    }
}

/// Compact "latest outcome" view of an action on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: QueueStatus,
    /// `<status>_YYYYMMDD_HHMMSS` built from the row's most relevant timestamp.
    pub raw: String,
}

/// One past attempt for a target key, newest first in listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: i64,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// `completed_at`, else `started_at`, else `created_at`.
    pub at: i64,
    pub error_message: Option<String>,
    pub result_summary: Option<String>,
}

/// Next due time of an action that has upcoming scheduled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingAction {
    pub action_name: String,
    pub next_run_at: i64,
    pub scheduled_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn status_round_trips_through_str() {
        for status in QueueStatus::ALL {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert_eq!(" Running ".parse::<QueueStatus>().unwrap(), QueueStatus::Running);
        assert!("done".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn terminal_states_do_not_regress() {
        for from in [QueueStatus::Success, QueueStatus::Cancelled, QueueStatus::Superseded] {
            for to in QueueStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(!QueueStatus::Failed.can_transition_to(QueueStatus::Pending));
        assert!(!QueueStatus::Running.can_transition_to(QueueStatus::Pending));
        assert!(!QueueStatus::Scheduled.can_transition_to(QueueStatus::Running));
    }

    #[test]
    fn lifecycle_edges_are_allowed() {
        assert!(QueueStatus::Scheduled.can_transition_to(QueueStatus::Pending));
        assert!(QueueStatus::Pending.can_transition_to(QueueStatus::Running));
        assert!(QueueStatus::Running.can_transition_to(QueueStatus::Success));
        assert!(QueueStatus::Running.can_transition_to(QueueStatus::Expired));
        assert!(QueueStatus::Failed.can_transition_to(QueueStatus::Superseded));
    }

    #[test]
    fn effective_priority_ages_and_caps() {
        assert_eq!(effective_priority(50, 0), 50);
        assert_eq!(effective_priority(50, 299), 50);
        assert_eq!(effective_priority(50, 300), 51);
        assert_eq!(effective_priority(50, 3000), 60);
        assert_eq!(effective_priority(99, 100_000), 100);
        assert_eq!(effective_priority(50, -600), 50);
    }

    #[test]
    fn effective_priority_is_monotonic_and_capped() {
        let mut rng = rand::thread_rng();
        for _ in 0..2_000 {
            let p = rng.gen_range(0..=MAX_PRIORITY);
            let a = rng.gen_range(0..1_000_000i64);
            let b = a + rng.gen_range(0..100_000i64);
            let ea = effective_priority(p, a);
            let eb = effective_priority(p, b);
            assert!(ea <= eb, "p={p} a={a} b={b}");
            assert!(eb <= MAX_PRIORITY);
            assert!(ea >= p);
        }
    }

    #[test]
    fn scheduled_request_defaults() {
        let req = NewQueueItem::scheduled("Recon", "aa:bb:cc:dd:ee:ff", None, 1_000);
        assert_eq!(req.status, QueueStatus::Scheduled);
        assert_eq!(req.priority, DEFAULT_SCHEDULED_PRIORITY);
        assert_eq!(req.trigger_source.as_deref(), Some("scheduler"));
        assert_eq!(req.scheduled_for, Some(1_000));
        assert_eq!(req.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn target_key_display() {
        let key = NewQueueItem::immediate("SSHBrute", "aa:bb", None)
            .port(22)
            .service("ssh")
            .key();
        assert_eq!(key.to_string(), "SSHBrute@aa:bb:22/ssh");
    }
}
