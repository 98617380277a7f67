use rusqlite::{Connection, params};
use rustrecon_types::{DetectedSoftware, PresenceRecord, normalize_mac};
use tracing::{debug, info};

use crate::error::DbError;
use crate::hosts::writable_mac;
use crate::presence::{SOFTWARE, Sighting};
use crate::rolling::SetDiff;
use crate::store::Store;

pub(crate) fn collapse_duplicates(conn: &Connection) -> Result<usize, DbError> {
    SOFTWARE.collapse_duplicates(conn)
}

pub(crate) fn normalize_null_ports(conn: &Connection) -> Result<usize, DbError> {
    SOFTWARE.normalize_null_ports(conn)
}

impl Store {
    pub fn add_detected_software(
        &self,
        mac: &str,
        cpe: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
        port: Option<u16>,
    ) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let cpe = cpe.trim();
        if cpe.is_empty() {
            return Err(DbError::InvalidInput("CPE is required".into()));
        }
        let now = self.now();
        let sighting = Sighting {
            mac: &mac,
            item: cpe,
            port: port.unwrap_or(0),
            ip,
            hostname,
        };
        let event = self.write(|tx| SOFTWARE.add(tx, &sighting, now))?;
        debug!(mac = %mac, cpe, %event, "software recorded");
        Ok(())
    }

    /// Reconcile the active CPEs of a host against `current`.
    pub fn update_detected_software_status(
        &self,
        mac: &str,
        current: &[String],
    ) -> Result<SetDiff<String>, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| SOFTWARE.reconcile(tx, &mac, None, current, None, now))
    }

    /// Move CPE ids stored as vulnerabilities by older scanners into
    /// `detected_software`. Returns the number of rows moved.
    pub fn migrate_cpe_from_vulnerabilities(&self) -> Result<usize, DbError> {
        let now = self.now();
        let moved = self.write(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, mac_address, ip, hostname, COALESCE(port, 0), vuln_id \
                 FROM vulnerabilities WHERE lower(vuln_id) LIKE 'cpe:%'",
            )?;
            type Row = (i64, String, Option<String>, Option<String>, u16, String);
            let rows: Vec<Row> = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                })?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            for (id, mac, ip, hostname, port, cpe) in &rows {
                let sighting = Sighting {
                    mac,
                    item: cpe,
                    port: *port,
                    ip: ip.as_deref(),
                    hostname: hostname.as_deref(),
                };
                SOFTWARE.add(tx, &sighting, now)?;
                tx.execute("DELETE FROM vulnerabilities WHERE id = ?1", params![id])?;
            }
            Ok(rows.len())
        })?;
        if moved > 0 {
            info!(moved, "migrated CPE rows out of vulnerabilities");
        }
        Ok(moved)
    }

    pub fn list_detected_software(
        &self,
        mac: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<DetectedSoftware>, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mac_address, ip, hostname, COALESCE(port, 0), cpe, first_seen, \
                 last_seen, is_active FROM detected_software \
                 WHERE (?1 IS NULL OR mac_address = ?1) AND (?2 = 0 OR is_active = 1) \
                 ORDER BY mac_address, cpe, port",
            )?;
            let rows = stmt.query_map(params![mac, active_only], |r| {
                Ok(DetectedSoftware {
                    id: r.get(0)?,
                    mac_address: r.get(1)?,
                    ip: r.get(2)?,
                    hostname: r.get(3)?,
                    port: r.get(4)?,
                    cpe: r.get(5)?,
                    first_seen: r.get(6)?,
                    last_seen: r.get(7)?,
                    is_active: r.get::<_, i64>(8)? != 0,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn detected_software_history(
        &self,
        cpe: Option<&str>,
        mac: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| SOFTWARE.history(conn, cpe, mac.as_deref(), limit))
    }

    /// Any active CPE on the host, or one matching `cpe` by prefix.
    pub fn has_active_software(&self, mac: &str, cpe: Option<&str>) -> Result<bool, DbError> {
        let mac = normalize_mac(mac);
        let Some(cpe) = cpe else {
            return self.read(|conn| SOFTWARE.has_active(conn, &mac, None));
        };
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM detected_software WHERE mac_address = ?1 \
                 AND is_active = 1 AND lower(cpe) LIKE lower(?2) || '%')",
                params![mac, cpe.trim()],
                |r| r.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use rustrecon_types::PresenceEvent;
    use std::sync::Arc;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";
    const APACHE: &str = "cpe:/a:apache:http_server:2.4.49";

    fn store() -> (Store, ManualClock) {
        let clock = ManualClock::new(4_000);
        let store =
            Store::open_in_memory_with(StoreConfig::default(), Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    #[test]
    fn status_update_marks_absent_inactive() {
        let (store, clock) = store();
        store.add_detected_software(MAC, APACHE, None, None, Some(80)).unwrap();
        store.add_detected_software(MAC, "cpe:/o:linux:linux_kernel", None, None, None).unwrap();
        clock.advance(30);
        let diff = store
            .update_detected_software_status(MAC, &[APACHE.to_string()])
            .unwrap();
        assert_eq!(diff.removed, vec!["cpe:/o:linux:linux_kernel".to_string()]);
        assert_eq!(diff.kept, vec![APACHE.to_string()]);

        let active = store.list_detected_software(Some(MAC), true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].port, 80);
        assert_eq!(active[0].last_seen, 4_030);
        assert!(store.has_active_software(MAC, Some("cpe:/a:apache")).unwrap());
        assert!(!store.has_active_software(MAC, Some("cpe:/o:linux")).unwrap());

        let history = store.detected_software_history(None, Some(MAC), 10).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.iter().any(|h| h.event == PresenceEvent::Inactive));
    }

    #[test]
    fn cpe_rows_migrate_out_of_vulnerabilities() {
        let (store, _clock) = store();
        store.add_vulnerability(MAC, "CPE:/a:vsftpd:vsftpd:2.3.4", None, None, Some(21)).unwrap();
        store.add_vulnerability(MAC, "CVE-2011-2523", None, None, Some(21)).unwrap();
        assert_eq!(store.migrate_cpe_from_vulnerabilities().unwrap(), 1);
        assert_eq!(store.migrate_cpe_from_vulnerabilities().unwrap(), 0);

        let vulns = store.list_vulnerabilities(Some(MAC), false).unwrap();
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0].vuln_id, "CVE-2011-2523");
        let software = store.list_detected_software(Some(MAC), true).unwrap();
        assert_eq!(software[0].cpe, "CPE:/a:vsftpd:vsftpd:2.3.4");
        assert_eq!(software[0].port, 21);
    }
}
