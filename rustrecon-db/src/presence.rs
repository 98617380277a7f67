//! Presence tracking shared by vulnerabilities and detected software.
//!
//! Both tables key a finding on `(mac, item, port)` with port `0` meaning
//! host-wide, keep an `is_active` flag, and append `new`/`seen`/`inactive`
//! events to a history table.

use rusqlite::{Connection, Row, params};
use rustrecon_types::{PresenceEvent, PresenceRecord};

use crate::error::DbError;
use crate::rolling::{SetDiff, diff_sets};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PresenceTable {
    pub table: &'static str,
    pub history: &'static str,
    pub item: &'static str,
}

pub(crate) const VULNERABILITIES: PresenceTable = PresenceTable {
    table: "vulnerabilities",
    history: "vulnerability_history",
    item: "vuln_id",
};

pub(crate) const SOFTWARE: PresenceTable = PresenceTable {
    table: "detected_software",
    history: "detected_software_history",
    item: "cpe",
};

/// Identity of one finding row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sighting<'a> {
    pub mac: &'a str,
    pub item: &'a str,
    pub port: u16,
    pub ip: Option<&'a str>,
    pub hostname: Option<&'a str>,
}

impl PresenceTable {
    fn log(
        &self,
        conn: &Connection,
        s: &Sighting<'_>,
        event: PresenceEvent,
        now: i64,
    ) -> Result<(), DbError> {
        conn.execute(
            &format!(
                "INSERT INTO {} (mac_address, ip, hostname, port, {}, event, seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.history, self.item
            ),
            params![s.mac, s.ip, s.hostname, s.port, s.item, event.as_str(), now],
        )?;
        Ok(())
    }

    /// Insert or reactivate a finding. Returns the event that was logged.
    pub fn add(
        &self,
        conn: &Connection,
        s: &Sighting<'_>,
        now: i64,
    ) -> Result<PresenceEvent, DbError> {
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET is_active = 1, ip = COALESCE(?1, ip), \
                 hostname = COALESCE(?2, hostname), last_seen = ?3 \
                 WHERE mac_address = ?4 AND {} = ?5 AND COALESCE(port, 0) = ?6",
                self.table, self.item
            ),
            params![s.ip, s.hostname, now, s.mac, s.item, s.port],
        )?;
        let event = if updated > 0 {
            PresenceEvent::Seen
        } else {
            conn.execute(
                &format!(
                    "INSERT INTO {} (mac_address, ip, hostname, port, {}, \
                     first_seen, last_seen, is_active) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)",
                    self.table, self.item
                ),
                params![s.mac, s.ip, s.hostname, s.port, s.item, now],
            )?;
            PresenceEvent::New
        };
        self.log(conn, s, event, now)?;
        Ok(event)
    }

    fn active_items(
        &self,
        conn: &Connection,
        mac: &str,
        port: Option<u16>,
    ) -> Result<Vec<String>, DbError> {
        let sql = format!(
            "SELECT DISTINCT {item} FROM {table} \
             WHERE mac_address = ?1 AND is_active = 1 AND (?2 IS NULL OR COALESCE(port, 0) = ?2) \
             ORDER BY {item}",
            item = self.item,
            table = self.table
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![mac, port], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Ports of the active rows for `item`, or just `port` when scoped.
    fn active_ports(
        &self,
        conn: &Connection,
        mac: &str,
        item: &str,
        port: Option<u16>,
    ) -> Result<Vec<u16>, DbError> {
        if let Some(port) = port {
            return Ok(vec![port]);
        }
        let sql = format!(
            "SELECT COALESCE(port, 0) FROM {} WHERE mac_address = ?1 AND {} = ?2 AND is_active = 1",
            self.table, self.item
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![mac, item], |r| r.get(0))?;
        Ok(rows.collect::<Result<Vec<u16>, _>>()?)
    }

    /// Reconcile the active findings of a host (optionally one port) with a
    /// fresh observation: absent items go inactive, present ones are
    /// touched, new ones are added. Every change is logged.
    pub fn reconcile(
        &self,
        conn: &Connection,
        mac: &str,
        port: Option<u16>,
        observed: &[String],
        ip: Option<&str>,
        now: i64,
    ) -> Result<SetDiff<String>, DbError> {
        let observed: Vec<String> = observed
            .iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();
        let existing = self.active_items(conn, mac, port)?;
        let diff = diff_sets(&existing, &observed);

        for item in &diff.removed {
            for p in self.active_ports(conn, mac, item, port)? {
                conn.execute(
                    &format!(
                        "UPDATE {} SET is_active = 0, last_seen = ?1 \
                         WHERE mac_address = ?2 AND {} = ?3 AND COALESCE(port, 0) = ?4 \
                         AND is_active = 1",
                        self.table, self.item
                    ),
                    params![now, mac, item, p],
                )?;
                let s = Sighting {
                    mac,
                    item,
                    port: p,
                    ip: None,
                    hostname: None,
                };
                self.log(conn, &s, PresenceEvent::Inactive, now)?;
            }
        }
        for item in &diff.added {
            let s = Sighting {
                mac,
                item,
                port: port.unwrap_or(0),
                ip,
                hostname: None,
            };
            self.add(conn, &s, now)?;
        }
        for item in &diff.kept {
            for p in self.active_ports(conn, mac, item, port)? {
                conn.execute(
                    &format!(
                        "UPDATE {} SET last_seen = ?1 \
                         WHERE mac_address = ?2 AND {} = ?3 AND COALESCE(port, 0) = ?4 \
                         AND is_active = 1",
                        self.table, self.item
                    ),
                    params![now, mac, item, p],
                )?;
                let s = Sighting {
                    mac,
                    item,
                    port: p,
                    ip: None,
                    hostname: None,
                };
                self.log(conn, &s, PresenceEvent::Seen, now)?;
            }
        }
        Ok(diff)
    }

    /// Merge rows sharing `(mac, item, COALESCE(port, 0))` into the newest one,
    /// keeping the earliest first sighting and latest last sighting.
    pub fn collapse_duplicates(&self, conn: &Connection) -> Result<usize, DbError> {
        let same_key = format!(
            "d.mac_address = {t}.mac_address AND d.{i} = {t}.{i} \
             AND COALESCE(d.port, 0) = COALESCE({t}.port, 0)",
            t = self.table,
            i = self.item
        );
        conn.execute(
            &format!(
                "UPDATE {t} SET \
                   first_seen = (SELECT MIN(d.first_seen) FROM {t} d WHERE {same_key}), \
                   last_seen = (SELECT MAX(d.last_seen) FROM {t} d WHERE {same_key}), \
                   is_active = (SELECT MAX(d.is_active) FROM {t} d WHERE {same_key}) \
                 WHERE id IN (SELECT MAX(id) FROM {t} GROUP BY mac_address, {i}, COALESCE(port, 0) \
                              HAVING COUNT(*) > 1)",
                t = self.table,
                i = self.item
            ),
            [],
        )?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {t} WHERE id NOT IN \
                 (SELECT MAX(id) FROM {t} GROUP BY mac_address, {i}, COALESCE(port, 0))",
                t = self.table,
                i = self.item
            ),
            [],
        )?;
        Ok(removed)
    }

    pub fn normalize_null_ports(&self, conn: &Connection) -> Result<usize, DbError> {
        let rows = conn.execute(
            &format!("UPDATE {} SET port = 0 WHERE port IS NULL", self.table),
            [],
        )?;
        let history = conn.execute(
            &format!("UPDATE {} SET port = 0 WHERE port IS NULL", self.history),
            [],
        )?;
        Ok(rows + history)
    }

    pub fn has_active(
        &self,
        conn: &Connection,
        mac: &str,
        item: Option<&str>,
    ) -> Result<bool, DbError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE mac_address = ?1 AND is_active = 1 \
             AND (?2 IS NULL OR lower({}) = lower(?2)))",
            self.table, self.item
        );
        Ok(conn.query_row(&sql, params![mac, item], |r| r.get(0))?)
    }

    /// History events, newest first.
    pub fn history(
        &self,
        conn: &Connection,
        item: Option<&str>,
        mac: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, DbError> {
        let sql = format!(
            "SELECT mac_address, ip, hostname, COALESCE(port, 0), {item}, event, seen_at \
             FROM {history} \
             WHERE (?1 IS NULL OR {item} = ?1) AND (?2 IS NULL OR mac_address = ?2) \
             ORDER BY seen_at DESC, id DESC LIMIT ?3",
            item = self.item,
            history = self.history
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![item, mac, limit as i64], record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PresenceRecord> {
    let event: String = row.get(5)?;
    let event = match event.as_str() {
        "new" => PresenceEvent::New,
        "inactive" => PresenceEvent::Inactive,
        _ => PresenceEvent::Seen,
    };
    Ok(PresenceRecord {
        mac_address: row.get(0)?,
        ip: row.get(1)?,
        hostname: row.get(2)?,
        port: row.get(3)?,
        item: row.get(4)?,
        event,
        seen_at: row.get(6)?,
    })
}
