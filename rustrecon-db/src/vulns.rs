use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, Row, params};
use rustrecon_types::{
    Finding, FindingKind, FindingSummary, PresenceRecord, Vulnerability, normalize_mac,
};
use tracing::{debug, info};

use crate::error::DbError;
use crate::hosts::writable_mac;
use crate::presence::{SOFTWARE, Sighting, VULNERABILITIES};
use crate::rolling::SetDiff;
use crate::store::Store;

pub(crate) fn collapse_duplicates(conn: &Connection) -> Result<usize, DbError> {
    VULNERABILITIES.collapse_duplicates(conn)
}

pub(crate) fn normalize_null_ports(conn: &Connection) -> Result<usize, DbError> {
    Ok(conn.execute("UPDATE vulnerabilities SET port = 0 WHERE port IS NULL", [])?)
}

/// History rows with NULL ports take port 0; the live table is host-wide for them too.
pub(crate) fn fix_history_nulls(conn: &Connection) -> Result<usize, DbError> {
    Ok(conn.execute(
        "UPDATE vulnerability_history SET port = 0 WHERE port IS NULL",
        [],
    )?)
}

fn vuln_from_row(row: &Row<'_>) -> rusqlite::Result<Vulnerability> {
    Ok(Vulnerability {
        id: row.get(0)?,
        mac_address: row.get(1)?,
        ip: row.get(2)?,
        hostname: row.get(3)?,
        port: row.get(4)?,
        vuln_id: row.get(5)?,
        first_seen: row.get(6)?,
        last_seen: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
    })
}

impl Store {
    /// Insert or reactivate one vulnerability. `port` `None` means host-wide.
    pub fn add_vulnerability(
        &self,
        mac: &str,
        vuln_id: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
        port: Option<u16>,
    ) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let vuln_id = vuln_id.trim();
        if vuln_id.is_empty() {
            return Err(DbError::InvalidInput("vulnerability id is required".into()));
        }
        let now = self.now();
        let sighting = Sighting {
            mac: &mac,
            item: vuln_id,
            port: port.unwrap_or(0),
            ip,
            hostname,
        };
        let event = self.write(|tx| VULNERABILITIES.add(tx, &sighting, now))?;
        debug!(mac = %mac, vuln_id, %event, "vulnerability recorded");
        Ok(())
    }

    /// Reconcile every active vulnerability of a host against `current`.
    pub fn update_vulnerability_status(
        &self,
        mac: &str,
        current: &[String],
    ) -> Result<SetDiff<String>, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| VULNERABILITIES.reconcile(tx, &mac, None, current, None, now))
    }

    /// Reconcile the vulnerabilities of one port (`0` = host-wide) against `current`.
    pub fn update_vulnerability_status_by_port(
        &self,
        mac: &str,
        port: u16,
        current: &[String],
    ) -> Result<SetDiff<String>, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| VULNERABILITIES.reconcile(tx, &mac, Some(port), current, None, now))
    }

    /// Persist a batch of scanner findings for one host.
    ///
    /// Findings are grouped by port. CVE ids reconcile the vulnerabilities of
    /// their port; CPE ids are recorded as detected software. Anything else
    /// is ignored. The whole batch commits in one transaction.
    pub fn save_vulnerabilities(
        &self,
        mac: &str,
        ip: Option<&str>,
        findings: &[Finding],
    ) -> Result<FindingSummary, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();

        let mut cves: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        let mut cpes: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
        let mut skipped = 0usize;
        for finding in findings {
            let port = finding.port.unwrap_or(0);
            match finding.kind() {
                FindingKind::Cve => cves
                    .entry(port)
                    .or_default()
                    .push(finding.id.to_ascii_uppercase()),
                FindingKind::Cpe => {
                    cpes.entry(port).or_default().insert(finding.id.clone());
                }
                FindingKind::Other => skipped += 1,
            }
        }

        let summary = self.write(|tx| {
            let mut vuln_ids = BTreeSet::new();
            for (port, ids) in &cves {
                VULNERABILITIES.reconcile(tx, &mac, Some(*port), ids, ip, now)?;
                vuln_ids.extend(ids.iter().cloned());
            }
            let mut software = BTreeSet::new();
            for (port, items) in &cpes {
                for cpe in items {
                    let sighting = Sighting {
                        mac: &mac,
                        item: cpe,
                        port: *port,
                        ip,
                        hostname: None,
                    };
                    SOFTWARE.add(tx, &sighting, now)?;
                    software.insert(cpe.as_str());
                }
            }
            let ports: BTreeSet<u16> = cves.keys().chain(cpes.keys()).copied().collect();
            Ok(FindingSummary {
                vulnerabilities: vuln_ids.len(),
                software: software.len(),
                ports: ports.len(),
            })
        })?;
        debug!(
            mac = %mac,
            vulnerabilities = summary.vulnerabilities,
            software = summary.software,
            ports = summary.ports,
            skipped,
            "findings saved"
        );
        Ok(summary)
    }

    pub fn list_vulnerabilities(
        &self,
        mac: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<Vulnerability>, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mac_address, ip, hostname, COALESCE(port, 0), vuln_id, first_seen, \
                 last_seen, is_active FROM vulnerabilities \
                 WHERE (?1 IS NULL OR mac_address = ?1) AND (?2 = 0 OR is_active = 1) \
                 ORDER BY mac_address, vuln_id, port",
            )?;
            let rows = stmt.query_map(params![mac, active_only], vuln_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Vulnerabilities on hosts currently alive.
    pub fn count_vulnerabilities_alive(
        &self,
        distinct: bool,
        active_only: bool,
    ) -> Result<u64, DbError> {
        let select = if distinct {
            "COUNT(DISTINCT v.vuln_id)"
        } else {
            "COUNT(*)"
        };
        let sql = format!(
            "SELECT {select} FROM vulnerabilities v \
             JOIN hosts h ON h.mac_address = v.mac_address \
             WHERE h.alive = 1 AND (?1 = 0 OR v.is_active = 1)"
        );
        self.read(|conn| {
            let n: i64 = conn.query_row(&sql, params![active_only], |r| r.get(0))?;
            Ok(n as u64)
        })
    }

    pub fn list_vulnerability_history(
        &self,
        vuln_id: Option<&str>,
        mac: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PresenceRecord>, DbError> {
        let mac = mac.map(normalize_mac);
        self.read(|conn| VULNERABILITIES.history(conn, vuln_id, mac.as_deref(), limit))
    }

    pub fn has_active_vuln(&self, mac: &str, vuln_id: Option<&str>) -> Result<bool, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| VULNERABILITIES.has_active(conn, &mac, vuln_id))
    }

    /// Collapse duplicate `(mac, vuln_id, port)` rows left by older schemas.
    pub fn cleanup_vulnerability_duplicates(&self) -> Result<usize, DbError> {
        let removed = self.write(|tx| {
            let removed = collapse_duplicates(tx)?;
            normalize_null_ports(tx)?;
            Ok(removed)
        })?;
        if removed > 0 {
            info!(removed, "collapsed duplicate vulnerabilities");
        }
        Ok(removed)
    }

    pub fn fix_vulnerability_history_nulls(&self) -> Result<usize, DbError> {
        self.write(|tx| fix_history_nulls(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use rustrecon_types::{HostUpdate, PresenceEvent};
    use std::sync::Arc;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn store() -> (Store, ManualClock) {
        let clock = ManualClock::new(3_000);
        let store =
            Store::open_in_memory_with(StoreConfig::default(), Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn by_port_reconcile_tracks_presence() {
        let (store, clock) = store();
        store
            .update_vulnerability_status_by_port(MAC, 80, &ids(&["CVE-1", "CVE-2"]))
            .unwrap();
        store
            .update_vulnerability_status_by_port(MAC, 443, &ids(&["CVE-1"]))
            .unwrap();
        clock.advance(100);
        let diff = store
            .update_vulnerability_status_by_port(MAC, 80, &ids(&["CVE-2", "CVE-3"]))
            .unwrap();
        assert_eq!(diff.removed, ids(&["CVE-1"]));
        assert_eq!(diff.added, ids(&["CVE-3"]));

        let active = store.list_vulnerabilities(Some(MAC), true).unwrap();
        let keys: Vec<(u16, &str)> = active.iter().map(|v| (v.port, v.vuln_id.as_str())).collect();
        // Port 443 keeps its own CVE-1.
        assert_eq!(keys, vec![(443, "CVE-1"), (80, "CVE-2"), (80, "CVE-3")]);

        let history = store.list_vulnerability_history(Some("CVE-1"), Some(MAC), 10).unwrap();
        assert_eq!(history[0].event, PresenceEvent::Inactive);
        assert_eq!(history[0].port, 80);
        assert_eq!(history[0].seen_at, 3_100);
    }

    #[test]
    fn reactivation_keeps_first_seen() {
        let (store, clock) = store();
        store.add_vulnerability(MAC, "CVE-9", Some("10.0.0.5"), None, Some(22)).unwrap();
        clock.advance(10);
        store.update_vulnerability_status(MAC, &[]).unwrap();
        assert!(!store.has_active_vuln(MAC, Some("cve-9")).unwrap());
        clock.advance(10);
        store.add_vulnerability(MAC, "CVE-9", None, None, Some(22)).unwrap();

        let all = store.list_vulnerabilities(Some(MAC), false).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_active);
        assert_eq!(all[0].first_seen, 3_000);
        assert_eq!(all[0].last_seen, 3_020);
        assert_eq!(all[0].ip.as_deref(), Some("10.0.0.5"));

        let events: Vec<PresenceEvent> = store
            .list_vulnerability_history(None, Some(MAC), 10)
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(
            events,
            vec![PresenceEvent::Seen, PresenceEvent::Inactive, PresenceEvent::New]
        );
    }

    #[test]
    fn save_routes_cpes_to_software() {
        let (store, _clock) = store();
        let findings = vec![
            Finding::new("CVE-2021-41773", Some(80)),
            Finding::new("cpe:/a:apache:http_server:2.4.49", Some(80)),
            Finding::new("cve-2023-0001", None),
            Finding::new("weak-cipher", Some(443)),
        ];
        let summary = store
            .save_vulnerabilities(MAC, Some("10.0.0.5"), &findings)
            .unwrap();
        assert_eq!(
            summary,
            FindingSummary {
                vulnerabilities: 2,
                software: 1,
                ports: 2,
            }
        );
        let vulns = store.list_vulnerabilities(Some(MAC), true).unwrap();
        assert_eq!(vulns.len(), 2);
        assert!(vulns.iter().any(|v| v.port == 0 && v.vuln_id == "CVE-2023-0001"));
        let software = store.list_detected_software(Some(MAC), true).unwrap();
        assert_eq!(software[0].cpe, "cpe:/a:apache:http_server:2.4.49");
        assert_eq!(software[0].ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn alive_counts_join_hosts() {
        let (store, _clock) = store();
        store.update_host(MAC, &HostUpdate::default()).unwrap();
        store.update_host("11:11:11:11:11:11", &HostUpdate::default().alive(false)).unwrap();
        store.add_vulnerability(MAC, "CVE-1", None, None, Some(80)).unwrap();
        store.add_vulnerability(MAC, "CVE-1", None, None, Some(443)).unwrap();
        store.add_vulnerability("11:11:11:11:11:11", "CVE-2", None, None, None).unwrap();
        assert_eq!(store.count_vulnerabilities_alive(false, true).unwrap(), 2);
        assert_eq!(store.count_vulnerabilities_alive(true, true).unwrap(), 1);
    }

    #[test]
    fn cleanup_is_rerunnable() {
        let (store, _clock) = store();
        store.add_vulnerability(MAC, "CVE-1", None, None, None).unwrap();
        assert_eq!(store.cleanup_vulnerability_duplicates().unwrap(), 0);
        assert_eq!(store.fix_vulnerability_history_nulls().unwrap(), 0);
        assert_eq!(store.list_vulnerabilities(None, false).unwrap().len(), 1);
    }

    #[test]
    fn empty_id_is_rejected() {
        let (store, _clock) = store();
        assert!(matches!(
            store.add_vulnerability(MAC, " ", None, None, None),
            Err(DbError::InvalidInput(_))
        ));
    }
}
