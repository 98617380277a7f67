use rustrecon_types::{NewQueueItem, QueueItem, QueueStatus};
use serde_json::{Map, Value};

use crate::config::OrchestratorConfig;

/// Seconds to wait before retry number `retry_count + 1`: `base * 2^retry_count`, capped.
pub fn retry_delay(retry_count: u32, base_secs: u64, cap_secs: u64) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_secs.saturating_mul(factor).min(cap_secs)
}

/// When and whether failed attempts come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            enabled: config.retry_failed,
            base_secs: config.backoff_base_secs,
            cap_secs: config.backoff_cap_secs,
        }
    }

    /// Follow-up attempt for a failed or expired row, or `None` when the row
    /// is not retryable. A row with `retry_count == max_retries` never comes back.
    pub fn retry_for(&self, item: &QueueItem, now: i64) -> Option<NewQueueItem> {
        if !self.enabled
            || !matches!(item.status, QueueStatus::Failed | QueueStatus::Expired)
            || !item.retries_left()
        {
            return None;
        }
        let delay = retry_delay(item.retry_count, self.base_secs, self.cap_secs);
        let run_at = now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));

        let mut metadata = match &item.metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        metadata.insert("retry_of".into(), Value::from(item.id));

        let mut request = NewQueueItem::scheduled(
            &item.action_name,
            &item.mac_address,
            item.ip.as_deref(),
            run_at,
        )
        .maybe_port(item.port)
        .priority(item.priority)
        .trigger("retry")
        .tags(item.tags.clone())
        .metadata(Value::Object(metadata))
        .max_retries(item.max_retries)
        .retry_count(item.retry_count);
        request.hostname = item.hostname.clone();
        request.service = item.service.clone();
        Some(request)
    }
}
