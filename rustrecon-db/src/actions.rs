use rusqlite::{Connection, OptionalExtension, Row, params};
use rustrecon_types::ActionDefinition;
use tracing::info;

use crate::error::DbError;
use crate::store::Store;

const ACTION_COLUMNS: &str = "name, module, port, services, trigger_spec, requires, priority, \
     timeout_secs, max_retries, cooldown_secs, rate_limit, stealth_level, risk_level, enabled, \
     scope, tags, args, description";

fn text_column<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T: serde::de::DeserializeOwned + Default>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(T::default()),
    }
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<ActionDefinition> {
    Ok(ActionDefinition {
        name: row.get(0)?,
        module: row.get(1)?,
        port: row.get(2)?,
        services: json_column(row, 3)?,
        trigger: row.get(4)?,
        requires: row.get(5)?,
        priority: row.get(6)?,
        timeout_secs: row.get::<_, i64>(7)?.max(0) as u64,
        max_retries: row.get(8)?,
        cooldown_secs: row.get::<_, i64>(9)?.max(0) as u64,
        rate_limit: row.get(10)?,
        stealth_level: row.get(11)?,
        risk_level: text_column(row, 12)?,
        enabled: row.get::<_, i64>(13)? != 0,
        scope: text_column(row, 14)?,
        tags: json_column(row, 15)?,
        args: json_column(row, 16)?,
        description: row.get(17)?,
    })
}

fn refresh_actions_count(conn: &Connection) -> Result<u64, DbError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM actions WHERE enabled = 1", [], |r| {
        r.get(0)
    })?;
    conn.execute("UPDATE stats SET actions_count = ?1 WHERE id = 1", params![count])?;
    Ok(count as u64)
}

fn validate(def: &ActionDefinition) -> Result<(), DbError> {
    if def.name.trim().is_empty() {
        return Err(DbError::InvalidInput("action name is required".into()));
    }
    if !(0..=rustrecon_types::MAX_PRIORITY).contains(&def.priority) {
        return Err(DbError::InvalidInput(format!(
            "action {}: priority {} outside 0..=100",
            def.name, def.priority
        )));
    }
    Ok(())
}

impl Store {
    /// Upsert catalog entries in one transaction and refresh the enabled
    /// action counter. Actions missing from `defs` are left alone.
    pub fn sync_actions(&self, defs: &[ActionDefinition]) -> Result<usize, DbError> {
        for def in defs {
            validate(def)?;
        }
        let encoded = defs
            .iter()
            .map(|d| {
                Ok((
                    serde_json::to_string(&d.services)?,
                    serde_json::to_string(&d.tags)?,
                    d.args.as_ref().map(serde_json::to_string).transpose()?,
                ))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        let now = self.now();

        let enabled = self.write(|tx| {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO actions ({ACTION_COLUMNS}, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
                 ON CONFLICT(name) DO UPDATE SET \
                   module = excluded.module, port = excluded.port, services = excluded.services, \
                   trigger_spec = excluded.trigger_spec, requires = excluded.requires, \
                   priority = excluded.priority, timeout_secs = excluded.timeout_secs, \
                   max_retries = excluded.max_retries, cooldown_secs = excluded.cooldown_secs, \
                   rate_limit = excluded.rate_limit, stealth_level = excluded.stealth_level, \
                   risk_level = excluded.risk_level, enabled = excluded.enabled, \
                   scope = excluded.scope, tags = excluded.tags, args = excluded.args, \
                   description = excluded.description, updated_at = excluded.updated_at"
            ))?;
            for (def, (services, tags, args)) in defs.iter().zip(&encoded) {
                stmt.execute(params![
                    def.name.trim(),
                    def.module,
                    def.port,
                    services,
                    def.trigger,
                    def.requires,
                    def.priority,
                    def.timeout_secs as i64,
                    def.max_retries,
                    def.cooldown_secs as i64,
                    def.rate_limit,
                    def.stealth_level,
                    def.risk_level.to_string(),
                    def.enabled,
                    def.scope.to_string(),
                    tags,
                    args,
                    def.description,
                    now
                ])?;
            }
            drop(stmt);
            refresh_actions_count(tx)
        })?;
        info!(synced = defs.len(), enabled, "action catalog synchronized");
        Ok(defs.len())
    }

    pub fn list_actions(&self) -> Result<Vec<ActionDefinition>, DbError> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ACTION_COLUMNS} FROM actions ORDER BY name"))?;
            let rows = stmt.query_map([], action_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Enabled actions, highest priority first.
    pub fn enabled_actions(&self) -> Result<Vec<ActionDefinition>, DbError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM actions WHERE enabled = 1 \
                 ORDER BY priority DESC, name"
            ))?;
            let rows = stmt.query_map([], action_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn get_action(&self, name: &str) -> Result<Option<ActionDefinition>, DbError> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ACTION_COLUMNS} FROM actions WHERE name = ?1"),
                    params![name.trim()],
                    action_from_row,
                )
                .optional()?)
        })
    }

    /// Remove an action from the catalog. Queue history is kept.
    pub fn delete_action(&self, name: &str) -> Result<bool, DbError> {
        let name = name.trim();
        self.write(|tx| {
            let removed = tx.execute("DELETE FROM actions WHERE name = ?1", params![name])?;
            refresh_actions_count(tx)?;
            Ok(removed > 0)
        })
    }

    pub fn set_action_enabled(&self, name: &str, enabled: bool) -> Result<(), DbError> {
        let name = name.trim();
        let now = self.now();
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE actions SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
                params![name, enabled, now],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("action {name}")));
            }
            refresh_actions_count(tx)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrecon_types::{ActionScope, RiskLevel};
    use serde_json::json;

    fn def(name: &str) -> ActionDefinition {
        ActionDefinition::new(name)
    }

    fn actions_count(store: &Store) -> i64 {
        store
            .read(|c| {
                Ok(c.query_row("SELECT actions_count FROM stats WHERE id = 1", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap()
    }

    #[test]
    fn sync_round_trips_every_field() {
        let store = Store::open_in_memory().unwrap();
        let mut ssh = def("SSHBrute");
        ssh.module = Some("ssh_brute".into());
        ssh.port = Some(22);
        ssh.services = vec!["ssh".into()];
        ssh.trigger = Some("on_service:ssh".into());
        ssh.requires = Some(r#"{"action":"PortScan","status":"success"}"#.into());
        ssh.priority = 70;
        ssh.rate_limit = Some("3/600".into());
        ssh.risk_level = RiskLevel::High;
        ssh.scope = ActionScope::Normal;
        ssh.tags = vec!["brute".into()];
        ssh.args = Some(json!({"wordlist": "top100"}));

        assert_eq!(store.sync_actions(&[ssh.clone(), def("PortScan")]).unwrap(), 2);
        assert_eq!(store.get_action("SSHBrute").unwrap(), Some(ssh));
        assert_eq!(store.list_actions().unwrap().len(), 2);
        assert_eq!(actions_count(&store), 2);
    }

    #[test]
    fn resync_updates_and_counts_enabled() {
        let store = Store::open_in_memory().unwrap();
        store.sync_actions(&[def("A"), def("B")]).unwrap();
        let mut b = def("B");
        b.enabled = false;
        b.priority = 90;
        store.sync_actions(&[b]).unwrap();
        assert_eq!(actions_count(&store), 1);
        let enabled: Vec<String> = store
            .enabled_actions()
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(enabled, vec!["A".to_string()]);

        store.set_action_enabled("B", true).unwrap();
        assert_eq!(store.enabled_actions().unwrap()[0].name, "B");
        assert!(store.delete_action("A").unwrap());
        assert!(!store.delete_action("A").unwrap());
        assert_eq!(actions_count(&store), 1);
        assert!(matches!(store.set_action_enabled("A", true), Err(DbError::NotFound(_))));
    }

    #[test]
    fn invalid_definitions_are_rejected_before_writing() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = def("Bad");
        bad.priority = 150;
        assert!(matches!(
            store.sync_actions(&[def("Good"), bad]),
            Err(DbError::InvalidInput(_))
        ));
        assert!(store.list_actions().unwrap().is_empty());
    }
}
