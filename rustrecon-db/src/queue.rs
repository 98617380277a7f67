use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rustrecon_types::{
    AGING_STEP_SECS, AttemptRecord, MAX_PRIORITY, NewQueueItem, QueueItem, QueueStatus,
    StatusSnapshot, UpcomingAction, normalize_mac,
};
use tracing::{debug, info};

use crate::error::DbError;
use crate::store::Store;

pub(crate) const SUPERSEDED_MESSAGE: &str = "superseded by newer success";

/// Base priority plus one point per aging step waited, capped. `?1` is "now".
static AGED_PRIORITY: LazyLock<String> = LazyLock::new(|| {
    format!("MIN({MAX_PRIORITY}, priority + MAX(0, ?1 - created_at) / {AGING_STEP_SECS})")
});

/// Column list shared by every queue read. `?1` must be bound to "now".
static QUEUE_COLUMNS: LazyLock<String> = LazyLock::new(|| {
    format!(
        "id, action_name, mac_address, ip, port, hostname, service, priority, \
         {aged} AS priority_effective, \
         status, retry_count, max_retries, created_at, scheduled_for, started_at, \
         completed_at, expires_at, trigger_source, dependencies, conditions, \
         result_summary, error_message, tags, metadata",
        aged = AGED_PRIORITY.as_str()
    )
});

/// Selection order for pending work: aged priority, then due time, then insertion.
static PENDING_ORDER: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{aged} DESC, COALESCE(scheduled_for, created_at) ASC, id ASC",
        aged = AGED_PRIORITY.as_str()
    )
});

const LIST_ORDER: &str = "CASE status \
     WHEN 'running' THEN 0 WHEN 'pending' THEN 1 WHEN 'scheduled' THEN 2 \
     WHEN 'failed' THEN 3 WHEN 'success' THEN 4 WHEN 'expired' THEN 5 \
     WHEN 'cancelled' THEN 6 ELSE 7 END, \
     priority_effective DESC, COALESCE(scheduled_for, created_at) ASC, id ASC";

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn port_from_sql(raw: Option<i64>) -> Option<u16> {
    raw.and_then(|p| u16::try_from(p).ok())
}

fn decode_tags(raw: Option<String>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(tags) = serde_json::from_str::<Vec<String>>(trimmed) {
            return tags;
        }
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn queue_item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let status: String = row.get("status")?;
    let status = status
        .parse::<QueueStatus>()
        .map_err(|e| conversion_error(9, e))?;
    let metadata: Option<String> = row.get("metadata")?;
    let metadata = match metadata.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| conversion_error(23, e))?),
    };
    Ok(QueueItem {
        id: row.get("id")?,
        action_name: row.get("action_name")?,
        mac_address: row.get("mac_address")?,
        ip: row.get("ip")?,
        port: port_from_sql(row.get("port")?),
        hostname: row.get("hostname")?,
        service: row.get("service")?,
        priority: row.get("priority")?,
        priority_effective: row.get("priority_effective")?,
        status,
        retry_count: row.get::<_, i64>("retry_count")?.max(0) as u32,
        max_retries: row.get::<_, i64>("max_retries")?.max(0) as u32,
        created_at: row.get("created_at")?,
        scheduled_for: row.get("scheduled_for")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        expires_at: row.get("expires_at")?,
        trigger_source: row.get("trigger_source")?,
        dependencies: row.get("dependencies")?,
        conditions: row.get("conditions")?,
        result_summary: row.get("result_summary")?,
        error_message: row.get("error_message")?,
        tags: decode_tags(row.get("tags")?),
        metadata,
    })
}

fn query_items(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<QueueItem>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, queue_item_from_row)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn get_item_in(conn: &Connection, id: i64, now: i64) -> Result<Option<QueueItem>, DbError> {
    let sql = format!(
        "SELECT {columns} FROM action_queue WHERE id = ?2",
        columns = QUEUE_COLUMNS.as_str()
    );
    Ok(conn
        .query_row(&sql, params![now, id], queue_item_from_row)
        .optional()?)
}

/// `<status>_YYYYMMDD_HHMMSS` in UTC.
pub fn format_status_id(status: QueueStatus, ts: i64) -> String {
    let stamp = DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "00000000_000000".to_string());
    format!("{status}_{stamp}")
}

/// Trim and check the fields every queue row needs.
fn validate(item: &NewQueueItem) -> Result<NewQueueItem, DbError> {
    let mut item = item.clone();
    item.action_name = item.action_name.trim().to_string();
    item.mac_address = normalize_mac(&item.mac_address);
    if item.action_name.is_empty() {
        return Err(DbError::InvalidInput("action name is required".into()));
    }
    if item.mac_address.is_empty() {
        return Err(DbError::InvalidInput(format!(
            "target MAC is required for action {}",
            item.action_name
        )));
    }
    if !(0..=MAX_PRIORITY).contains(&item.priority) {
        return Err(DbError::InvalidInput(format!(
            "priority {} outside 0..={MAX_PRIORITY}",
            item.priority
        )));
    }
    if item.retry_count > item.max_retries {
        return Err(DbError::InvalidInput(format!(
            "retry_count {} exceeds max_retries {}",
            item.retry_count, item.max_retries
        )));
    }
    if item.status == QueueStatus::Scheduled && item.scheduled_for.is_none() {
        return Err(DbError::InvalidInput(
            "scheduled items need a run time".into(),
        ));
    }
    Ok(item)
}

fn insert_item(conn: &Connection, item: &NewQueueItem, now: i64) -> Result<i64, DbError> {
    let tags = if item.tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&item.tags)?)
    };
    let metadata = item
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let started_at = (item.status == QueueStatus::Running).then_some(now);
    let completed_at = item.status.is_terminal().then_some(now);
    conn.execute(
        "INSERT INTO action_queue (action_name, mac_address, ip, port, hostname, service, \
         priority, status, retry_count, max_retries, created_at, scheduled_for, started_at, \
         completed_at, expires_at, trigger_source, dependencies, conditions, tags, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
         ?18, ?19, ?20)",
        params![
            item.action_name,
            item.mac_address,
            item.ip,
            item.port,
            item.hostname,
            item.service,
            item.priority,
            item.status.as_str(),
            item.retry_count,
            item.max_retries,
            now,
            item.scheduled_for,
            started_at,
            completed_at,
            item.expires_at,
            item.trigger_source,
            item.dependencies,
            item.conditions,
            tags,
            metadata,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert, treating a clash with an existing upcoming schedule as "nothing to do".
fn insert_unless_scheduled(
    conn: &Connection,
    item: &NewQueueItem,
    now: i64,
) -> Result<Option<i64>, DbError> {
    match insert_item(conn, item, now) {
        Ok(id) => Ok(Some(id)),
        Err(e) if item.status == QueueStatus::Scheduled && e.is_constraint_violation() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn has_active_in(
    conn: &Connection,
    action_name: &str,
    mac: &str,
    port: Option<u16>,
) -> Result<bool, DbError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM action_queue \
         WHERE action_name = ?1 AND mac_address = ?2 AND COALESCE(port, 0) = COALESCE(?3, 0) \
         AND status IN ('scheduled', 'pending', 'running'))",
        params![action_name, mac, port],
        |r| r.get(0),
    )?)
}

pub(crate) fn supersede_in(
    conn: &Connection,
    action_name: &str,
    mac: &str,
    port: Option<u16>,
    ref_ts: i64,
    now: i64,
) -> Result<usize, DbError> {
    let n = conn.execute(
        "UPDATE action_queue SET status = 'superseded', \
         error_message = COALESCE(error_message, ?6), \
         completed_at = COALESCE(completed_at, ?5) \
         WHERE action_name = ?1 AND mac_address = ?2 AND COALESCE(port, 0) = COALESCE(?3, 0) \
         AND status IN ('failed', 'expired') \
         AND COALESCE(completed_at, started_at, created_at) <= ?4",
        params![action_name, mac, port, ref_ts, now, SUPERSEDED_MESSAGE],
    )?;
    Ok(n)
}

impl Store {
    /// Queue a pending run. No deduplication.
    pub fn enqueue_immediate(&self, request: NewQueueItem) -> Result<i64, DbError> {
        let mut item = validate(&request)?;
        item.status = QueueStatus::Pending;
        item.scheduled_for = None;
        let now = self.now();
        let id = self.write(|tx| insert_item(tx, &item, now))?;
        debug!(id, action = %item.action_name, mac = %item.mac_address, "queued immediate");
        Ok(id)
    }

    /// Queue a deferred run. Returns `false` when an equivalent upcoming
    /// schedule already exists for the target key.
    pub fn enqueue_scheduled(&self, request: NewQueueItem) -> Result<bool, DbError> {
        let item = validate(&NewQueueItem {
            status: QueueStatus::Scheduled,
            ..request
        })?;
        let now = self.now();
        let id = self.write(|tx| insert_unless_scheduled(tx, &item, now))?;
        match id {
            Some(id) => debug!(id, key = %item.key(), run_at = ?item.scheduled_for, "scheduled"),
            None => debug!(key = %item.key(), "already scheduled"),
        }
        Ok(id.is_some())
    }

    /// Insert a row with any initial status. Returns `None` when a scheduled
    /// insert collides with an existing upcoming schedule.
    pub fn enqueue_generic(&self, request: &NewQueueItem) -> Result<Option<i64>, DbError> {
        let item = validate(request)?;
        let now = self.now();
        self.write(|tx| insert_unless_scheduled(tx, &item, now))
    }

    /// Insert unless the target key already has scheduled, pending or running work.
    pub fn enqueue_unless_active(&self, request: &NewQueueItem) -> Result<Option<i64>, DbError> {
        let item = validate(request)?;
        let now = self.now();
        self.write(|tx| {
            if has_active_in(tx, &item.action_name, &item.mac_address, item.port)? {
                return Ok(None);
            }
            insert_unless_scheduled(tx, &item, now)
        })
    }

    /// Best pending candidate without claiming it.
    pub fn get_next(&self) -> Result<Option<QueueItem>, DbError> {
        let now = self.now();
        let sql = format!(
            "SELECT {columns} FROM action_queue \
             WHERE status = 'pending' AND (scheduled_for IS NULL OR scheduled_for <= ?1) \
             ORDER BY {order} LIMIT 1",
            columns = QUEUE_COLUMNS.as_str(),
            order = PENDING_ORDER.as_str()
        );
        self.read(|conn| {
            Ok(conn
                .query_row(&sql, params![now], queue_item_from_row)
                .optional()?)
        })
    }

    /// Select the best pending candidate and mark it running in one statement.
    ///
    /// Concurrent callers never receive the same row.
    pub fn claim_next(&self) -> Result<Option<QueueItem>, DbError> {
        let now = self.now();
        let claim_sql = format!(
            "UPDATE action_queue SET status = 'running', started_at = ?1 \
             WHERE id = (SELECT id FROM action_queue \
                         WHERE status = 'pending' \
                         AND (scheduled_for IS NULL OR scheduled_for <= ?1) \
                         ORDER BY {order} LIMIT 1) \
             AND status = 'pending' \
             RETURNING id",
            order = PENDING_ORDER.as_str()
        );
        let item = self.write(|tx| {
            let id: Option<i64> = tx
                .query_row(&claim_sql, params![now], |r| r.get(0))
                .optional()?;
            match id {
                Some(id) => get_item_in(tx, id, now),
                None => Ok(None),
            }
        })?;
        if let Some(item) = &item {
            debug!(id = item.id, action = %item.action_name, mac = %item.mac_address, "claimed");
        }
        Ok(item)
    }

    /// Conditionally move one row from pending to running. `false` means
    /// another poller claimed it first (or it is no longer pending).
    pub fn claim(&self, id: i64) -> Result<bool, DbError> {
        let now = self.now();
        let changed = self.write(|tx| {
            Ok(tx.execute(
                "UPDATE action_queue SET status = 'running', started_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )?)
        })?;
        Ok(changed == 1)
    }

    /// Flip every due scheduled row to pending. Returns how many moved.
    pub fn promote_due_scheduled(&self) -> Result<usize, DbError> {
        let now = self.now();
        let n = self.write(|tx| {
            Ok(tx.execute(
                "UPDATE action_queue SET status = 'pending' \
                 WHERE status = 'scheduled' AND scheduled_for <= ?1",
                params![now],
            )?)
        })?;
        if n > 0 {
            debug!(promoted = n, "promoted due scheduled items");
        }
        Ok(n)
    }

    /// Record an outcome or a start.
    ///
    /// Failure-class outcomes bump `retry_count` (capped at `max_retries`).
    /// A success reclassifies earlier failures of the same target as
    /// superseded in the same transaction.
    pub fn update_status(
        &self,
        id: i64,
        status: QueueStatus,
        error: Option<&str>,
        result: Option<&str>,
    ) -> Result<(), DbError> {
        self.record_status(id, status, error, result, false).map(drop)
    }

    /// Record a worker's outcome for a row it claimed.
    ///
    /// Applies only while the row is still running. Returns `false` without
    /// touching the row when it already left `running` (expired by the stale
    /// sweep, cancelled by an operator).
    pub fn finish_running(
        &self,
        id: i64,
        status: QueueStatus,
        error: Option<&str>,
        result: Option<&str>,
    ) -> Result<bool, DbError> {
        if status == QueueStatus::Running {
            return Err(DbError::InvalidInput(
                "finish_running needs an outcome status".into(),
            ));
        }
        self.record_status(id, status, error, result, true)
    }

    fn record_status(
        &self,
        id: i64,
        status: QueueStatus,
        error: Option<&str>,
        result: Option<&str>,
        running_only: bool,
    ) -> Result<bool, DbError> {
        if matches!(
            status,
            QueueStatus::Scheduled | QueueStatus::Pending | QueueStatus::Superseded
        ) {
            return Err(DbError::InvalidInput(format!(
                "status {status} cannot be set directly"
            )));
        }
        let now = self.now();
        let superseded = self.write(|tx| {
            let row = tx
                .query_row(
                    "SELECT status, action_name, mac_address, port FROM action_queue WHERE id = ?1",
                    params![id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            port_from_sql(r.get(3)?),
                        ))
                    },
                )
                .optional()?;
            let Some((from, action_name, mac, port)) = row else {
                return Err(DbError::NotFound(format!("queue item {id}")));
            };
            let from = from
                .parse::<QueueStatus>()
                .map_err(|e| DbError::Other(e.to_string()))?;
            if running_only && from != QueueStatus::Running {
                return Ok(None);
            }
            if !from.can_transition_to(status) {
                return Err(DbError::InvalidTransition {
                    id,
                    from,
                    to: status,
                });
            }

            match status {
                QueueStatus::Running => {
                    tx.execute(
                        "UPDATE action_queue SET status = 'running', started_at = ?2 WHERE id = ?1",
                        params![id, now],
                    )?;
                }
                QueueStatus::Failed | QueueStatus::Expired => {
                    tx.execute(
                        "UPDATE action_queue SET status = ?2, completed_at = ?3, \
                         error_message = COALESCE(?4, error_message), \
                         result_summary = COALESCE(?5, result_summary), \
                         retry_count = MIN(retry_count + 1, max_retries) \
                         WHERE id = ?1",
                        params![id, status.as_str(), now, error, result],
                    )?;
                }
                _ => {
                    tx.execute(
                        "UPDATE action_queue SET status = ?2, completed_at = ?3, \
                         error_message = COALESCE(?4, error_message), \
                         result_summary = COALESCE(?5, result_summary) \
                         WHERE id = ?1",
                        params![id, status.as_str(), now, error, result],
                    )?;
                }
            }

            if status == QueueStatus::Success {
                supersede_in(tx, &action_name, &mac, port, now, now).map(Some)
            } else {
                Ok(Some(0))
            }
        })?;
        match superseded {
            Some(superseded) => {
                debug!(id, %status, superseded, "queue status updated");
                Ok(true)
            }
            None => {
                debug!(id, %status, "row no longer running, outcome dropped");
                Ok(false)
            }
        }
    }

    /// Reclassify failed/expired attempts of a key finished at or before
    /// `ref_ts` (default: now) as superseded.
    pub fn supersede_old_attempts(
        &self,
        action_name: &str,
        mac: &str,
        port: Option<u16>,
        ref_ts: Option<i64>,
    ) -> Result<usize, DbError> {
        let mac = normalize_mac(mac);
        let now = self.now();
        let ref_ts = ref_ts.unwrap_or(now);
        self.write(|tx| supersede_in(tx, action_name, &mac, port, ref_ts, now))
    }

    /// Cancel waiting or running work. Returns `false` if the row had already finished.
    pub fn cancel(&self, id: i64, reason: Option<&str>) -> Result<bool, DbError> {
        let now = self.now();
        let cancelled = self.write(|tx| {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM action_queue WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(status) = status else {
                return Err(DbError::NotFound(format!("queue item {id}")));
            };
            let status = status
                .parse::<QueueStatus>()
                .map_err(|e| DbError::Other(e.to_string()))?;
            if !status.can_transition_to(QueueStatus::Cancelled) {
                return Ok(false);
            }
            tx.execute(
                "UPDATE action_queue SET status = 'cancelled', completed_at = ?2, \
                 error_message = COALESCE(?3, error_message, 'cancelled') WHERE id = ?1",
                params![id, now, reason],
            )?;
            Ok(true)
        })?;
        if cancelled {
            info!(id, reason = reason.unwrap_or("cancelled"), "queue item cancelled");
        }
        Ok(cancelled)
    }

    pub fn get_item(&self, id: i64) -> Result<Option<QueueItem>, DbError> {
        let now = self.now();
        self.read(|conn| get_item_in(conn, id, now))
    }

    /// Attempts for a key, most recent first.
    pub fn attempt_history(
        &self,
        action_name: &str,
        mac: &str,
        port: Option<u16>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, retry_count, max_retries, \
                 COALESCE(completed_at, started_at, created_at) AS at, \
                 error_message, result_summary \
                 FROM action_queue \
                 WHERE action_name = ?1 AND mac_address = ?2 \
                 AND COALESCE(port, 0) = COALESCE(?3, 0) \
                 ORDER BY at DESC, id DESC LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![action_name, mac, port, limit as i64], |row| {
                let status: String = row.get(1)?;
                Ok(AttemptRecord {
                    id: row.get(0)?,
                    status: status.parse().map_err(|e| conversion_error(1, e))?,
                    retry_count: row.get::<_, i64>(2)?.max(0) as u32,
                    max_retries: row.get::<_, i64>(3)?.max(0) as u32,
                    at: row.get(4)?,
                    error_message: row.get(5)?,
                    result_summary: row.get(6)?,
                })
            })?;
            let mut history = Vec::new();
            for row in rows {
                history.push(row?);
            }
            Ok(history)
        })
    }

    /// Latest outcome of one action on one host.
    pub fn last_status_for(
        &self,
        mac: &str,
        action_name: &str,
    ) -> Result<Option<StatusSnapshot>, DbError> {
        let mac = normalize_mac(mac);
        let row = self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT status, \
                     COALESCE(completed_at, started_at, scheduled_for, created_at) AS ts \
                     FROM action_queue WHERE mac_address = ?1 AND action_name = ?2 \
                     ORDER BY ts DESC, id DESC LIMIT 1",
                    params![mac, action_name],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()?)
        })?;
        row.map(|(status, ts)| snapshot(&status, ts)).transpose()
    }

    /// Latest outcome of every action ever queued against a host.
    pub fn last_statuses_for_mac(
        &self,
        mac: &str,
    ) -> Result<BTreeMap<String, StatusSnapshot>, DbError> {
        let mac = normalize_mac(mac);
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action_name, status, ts FROM ( \
                   SELECT action_name, status, id, \
                          COALESCE(completed_at, started_at, scheduled_for, created_at) AS ts, \
                          ROW_NUMBER() OVER ( \
                            PARTITION BY action_name \
                            ORDER BY COALESCE(completed_at, started_at, scheduled_for, created_at) \
                                     DESC, id DESC \
                          ) AS rn \
                   FROM action_queue WHERE mac_address = ?1 \
                 ) WHERE rn = 1",
            )?;
            let rows = stmt.query_map(params![mac], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        let mut map = BTreeMap::new();
        for (action, status, ts) in rows {
            map.insert(action, snapshot(&status, ts)?);
        }
        Ok(map)
    }

    /// Most recent row for an action, optionally on one host.
    pub fn action_status(
        &self,
        action_name: &str,
        mac: Option<&str>,
    ) -> Result<Option<QueueItem>, DbError> {
        let now = self.now();
        let mac = mac.map(normalize_mac);
        let sql = format!(
            "SELECT {columns} FROM action_queue \
             WHERE action_name = ?2 AND (?3 IS NULL OR mac_address = ?3) \
             ORDER BY id DESC LIMIT 1",
            columns = QUEUE_COLUMNS.as_str()
        );
        self.read(|conn| {
            Ok(conn
                .query_row(&sql, params![now, action_name, mac], queue_item_from_row)
                .optional()?)
        })
    }

    /// Queue rows in display order. An empty filter lists everything.
    pub fn list_action_queue(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueItem>, DbError> {
        let now = self.now();
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            let list = statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("WHERE status IN ({list})")
        };
        let sql = format!(
            "SELECT {columns} FROM action_queue {filter} ORDER BY {LIST_ORDER}",
            columns = QUEUE_COLUMNS.as_str()
        );
        self.read(|conn| query_items(conn, &sql, &[&now]))
    }

    /// Next due time per action with upcoming scheduled work, soonest first.
    pub fn get_upcoming_actions_summary(&self) -> Result<Vec<UpcomingAction>, DbError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action_name, MIN(scheduled_for) AS next_run, COUNT(*) \
                 FROM action_queue WHERE status = 'scheduled' AND scheduled_for IS NOT NULL \
                 GROUP BY action_name ORDER BY next_run ASC, action_name ASC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(UpcomingAction {
                    action_name: r.get(0)?,
                    next_run_at: r.get(1)?,
                    scheduled_count: r.get::<_, i64>(2)? as u64,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Scheduled, pending or running work exists for `(action, mac, port)`.
    pub fn has_active(
        &self,
        action_name: &str,
        mac: &str,
        port: Option<u16>,
    ) -> Result<bool, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| has_active_in(conn, action_name, &mac, port))
    }

    /// Time of the last success or failure of an action.
    pub fn last_completion(
        &self,
        action_name: &str,
        mac: Option<&str>,
    ) -> Result<Option<i64>, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(completed_at) FROM action_queue \
                 WHERE action_name = ?1 AND (?2 IS NULL OR mac_address = ?2) \
                 AND status IN ('success', 'failed')",
                params![action_name, mac],
                |r| r.get(0),
            )?)
        })
    }

    /// Rows created for an action since `since`, for rate limiting.
    pub fn count_created_since(
        &self,
        action_name: &str,
        mac: Option<&str>,
        since: i64,
    ) -> Result<u64, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM action_queue \
                 WHERE action_name = ?1 AND (?2 IS NULL OR mac_address = ?2) AND created_at >= ?3",
                params![action_name, mac, since],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Whether a host has any row for `action` in `status`. `None` means any host.
    pub fn has_outcome(
        &self,
        action_name: &str,
        mac: Option<&str>,
        status: QueueStatus,
    ) -> Result<bool, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM action_queue \
                 WHERE action_name = ?1 AND (?2 IS NULL OR mac_address = ?2) AND status = ?3)",
                params![action_name, mac, status.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    /// Which of `actions` was queued most recently for a host, by its latest
    /// timestamp (completion, start, due time, creation).
    pub fn latest_action_among(
        &self,
        mac: &str,
        actions: &[&str],
    ) -> Result<Option<String>, DbError> {
        if actions.is_empty() {
            return Ok(None);
        }
        let mac = normalize_mac(mac);
        let placeholders = (0..actions.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT action_name FROM action_queue \
             WHERE mac_address = ?1 AND action_name IN ({placeholders}) \
             ORDER BY COALESCE(completed_at, started_at, scheduled_for, created_at) DESC, \
             id DESC LIMIT 1"
        );
        let params: Vec<&dyn rusqlite::ToSql> = std::iter::once(&mac as &dyn rusqlite::ToSql)
            .chain(actions.iter().map(|a| a as &dyn rusqlite::ToSql))
            .collect();
        self.read(|conn| {
            Ok(conn
                .query_row(&sql, params.as_slice(), |r| r.get(0))
                .optional()?)
        })
    }

    /// Newest failed or expired row of each target key that still has retries left
    /// and has not been followed by any other attempt.
    pub fn retry_candidates(&self) -> Result<Vec<QueueItem>, DbError> {
        let now = self.now();
        let sql = format!(
            "SELECT {columns} FROM action_queue a \
             WHERE a.status IN ('failed', 'expired') AND a.retry_count < a.max_retries \
             AND NOT EXISTS (SELECT 1 FROM action_queue b \
                             WHERE b.action_name = a.action_name \
                             AND b.mac_address = a.mac_address \
                             AND COALESCE(b.port, 0) = COALESCE(a.port, 0) \
                             AND b.id > a.id) \
             ORDER BY a.id ASC",
            columns = QUEUE_COLUMNS.as_str()
        );
        self.read(|conn| query_items(conn, &sql, &[&now]))
    }

    /// Pending rows whose `expires_at` has passed become expired.
    pub fn expire_overdue_pending(&self) -> Result<usize, DbError> {
        let now = self.now();
        let n = self.write(|tx| {
            Ok(tx.execute(
                "UPDATE action_queue SET status = 'expired', completed_at = ?1, \
                 error_message = COALESCE(error_message, 'expired before start'), \
                 retry_count = MIN(retry_count + 1, max_retries) \
                 WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
                params![now],
            )?)
        })?;
        if n > 0 {
            info!(expired = n, "expired overdue pending items");
        }
        Ok(n)
    }

    /// Running rows older than their `metadata.timeout` (or `default_timeout_secs`)
    /// plus `grace_secs` become expired. Covers workers that died mid-run; a live
    /// worker enforces the timeout itself and reports first.
    pub fn expire_stale_running(
        &self,
        default_timeout_secs: u64,
        grace_secs: u64,
    ) -> Result<usize, DbError> {
        let now = self.now();
        let default_timeout = default_timeout_secs as i64;
        let grace = grace_secs as i64;
        let n = self.write(|tx| {
            Ok(tx.execute(
                "UPDATE action_queue SET status = 'expired', completed_at = ?1, \
                 error_message = COALESCE(error_message, 'timed out while running'), \
                 retry_count = MIN(retry_count + 1, max_retries) \
                 WHERE status = 'running' AND started_at IS NOT NULL \
                 AND started_at + COALESCE( \
                     CASE WHEN json_valid(metadata) \
                          THEN CAST(json_extract(metadata, '$.timeout') AS INTEGER) END, \
                     ?2) + ?3 <= ?1",
                params![now, default_timeout, grace],
            )?)
        })?;
        if n > 0 {
            info!(expired = n, "expired stale running items");
        }
        Ok(n)
    }

    /// Delete finished rows older than `older_than_secs`.
    pub fn purge_completed(&self, older_than_secs: u64) -> Result<usize, DbError> {
        let cutoff = self.now() - older_than_secs as i64;
        let n = self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM action_queue \
                 WHERE status IN ('success', 'failed', 'expired', 'cancelled', 'superseded') \
                 AND COALESCE(completed_at, created_at) < ?1",
                params![cutoff],
            )?)
        })?;
        if n > 0 {
            info!(purged = n, "purged old queue rows");
        }
        Ok(n)
    }
}

fn snapshot(status: &str, ts: i64) -> Result<StatusSnapshot, DbError> {
    let status = status
        .parse::<QueueStatus>()
        .map_err(|e| DbError::Other(e.to_string()))?;
    Ok(StatusSnapshot {
        status,
        raw: format_status_id(status, ts),
    })
}
