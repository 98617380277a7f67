use rusqlite::{Connection, OptionalExtension, Row, params};
use rustrecon_types::{Host, HostUpdate, HostnameRecord, is_stub_mac, normalize_mac, stub_mac_for};
use tracing::{debug, warn};

use crate::error::DbError;
use crate::rolling::{
    ESSIDS_CAP, HOSTNAMES_CAP, IPS_CAP, PORTS_CAP, SetDiff, diff_and_roll, join_list, sort_ips,
    split_list, split_ports,
};
use crate::store::Store;

/// Tables whose `mac_address` column follows a host when a stub is merged.
const MAC_REFERENCES: &[&str] = &[
    "hostnames_history",
    "port_services",
    "port_service_history",
    "vulnerabilities",
    "vulnerability_history",
    "detected_software",
    "detected_software_history",
    "creds",
    "action_queue",
];

const HOST_COLUMNS: &str = "mac_address, ips, previous_ips, hostnames, previous_hostnames, ports, \
     previous_ports, vendor, essid, previous_essids, alive, first_seen, last_seen";

/// What `merge_ip_stub_into_real` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Neither identity existed; a fresh host row was created.
    Created,
    /// The stub was renamed to the real MAC.
    Renamed,
    /// Stub and real rows were unified and the stub deleted.
    Merged,
    /// Only the real host existed; its address data was refreshed.
    Refreshed,
}

/// Normalize a MAC for a host write. Stub identities are refused.
pub(crate) fn writable_mac(mac: &str) -> Result<String, DbError> {
    let mac = normalize_mac(mac);
    if mac.is_empty() {
        return Err(DbError::InvalidInput("MAC address is required".into()));
    }
    if is_stub_mac(&mac) {
        return Err(DbError::InvalidInput(format!(
            "stub identity {mac} cannot be written; merge it into a real MAC"
        )));
    }
    Ok(mac)
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    let essid: Option<String> = row.get(8)?;
    Ok(Host {
        mac_address: row.get(0)?,
        ips: split_list(row.get::<_, Option<String>>(1)?.as_deref()),
        previous_ips: split_list(row.get::<_, Option<String>>(2)?.as_deref()),
        hostnames: split_list(row.get::<_, Option<String>>(3)?.as_deref()),
        previous_hostnames: split_list(row.get::<_, Option<String>>(4)?.as_deref()),
        ports: split_ports(row.get::<_, Option<String>>(5)?.as_deref()),
        previous_ports: split_ports(row.get::<_, Option<String>>(6)?.as_deref()),
        vendor: row.get(7)?,
        essid: essid.filter(|e| !e.trim().is_empty()),
        previous_essids: split_list(row.get::<_, Option<String>>(9)?.as_deref()),
        alive: row.get::<_, i64>(10)? != 0,
        first_seen: row.get(11)?,
        last_seen: row.get(12)?,
    })
}

pub(crate) fn get_host_in(conn: &Connection, mac: &str) -> Result<Option<Host>, DbError> {
    let sql = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE mac_address = ?1");
    Ok(conn.query_row(&sql, params![mac], host_from_row).optional()?)
}

/// Create the host row if it does not exist yet, and mark it seen.
pub(crate) fn touch_host_in(conn: &Connection, mac: &str, now: i64) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO hosts (mac_address, alive, first_seen, last_seen) VALUES (?1, 1, ?2, ?2) \
         ON CONFLICT(mac_address) DO UPDATE SET last_seen = ?2",
        params![mac, now],
    )?;
    Ok(())
}

/// Keep first occurrences, drop blanks.
fn union_lists<'a>(parts: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        for item in part {
            let item = item.trim();
            if !item.is_empty() && !out.iter().any(|o| o == item) {
                out.push(item.to_string());
            }
        }
    }
    out
}

fn roll_ips_in(
    conn: &Connection,
    mac: &str,
    ips: &[String],
    now: i64,
) -> Result<SetDiff<String>, DbError> {
    touch_host_in(conn, mac, now)?;
    let (current, previous): (Option<String>, Option<String>) = conn.query_row(
        "SELECT ips, previous_ips FROM hosts WHERE mac_address = ?1",
        params![mac],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let observed = ips
        .iter()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());
    let mut rolled = diff_and_roll(
        &split_list(current.as_deref()),
        &split_list(previous.as_deref()),
        observed,
        IPS_CAP,
    );
    sort_ips(&mut rolled.current);
    conn.execute(
        "UPDATE hosts SET ips = ?2, previous_ips = ?3 WHERE mac_address = ?1",
        params![mac, join_list(&rolled.current), join_list(&rolled.previous)],
    )?;
    Ok(rolled.diff)
}

pub(crate) fn roll_ports_in(
    conn: &Connection,
    mac: &str,
    ports: &[u16],
    now: i64,
) -> Result<SetDiff<u16>, DbError> {
    touch_host_in(conn, mac, now)?;
    let (current, previous): (Option<String>, Option<String>) = conn.query_row(
        "SELECT ports, previous_ports FROM hosts WHERE mac_address = ?1",
        params![mac],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let rolled = diff_and_roll(
        &split_ports(current.as_deref()),
        &split_ports(previous.as_deref()),
        ports.iter().copied(),
        PORTS_CAP,
    );
    conn.execute(
        "UPDATE hosts SET ports = ?2, previous_ports = ?3 WHERE mac_address = ?1",
        params![mac, join_list(&rolled.current), join_list(&rolled.previous)],
    )?;
    Ok(rolled.diff)
}

fn set_hostname_in(conn: &Connection, mac: &str, hostname: &str, now: i64) -> Result<(), DbError> {
    touch_host_in(conn, mac, now)?;
    let (current, previous): (Option<String>, Option<String>) = conn.query_row(
        "SELECT hostnames, previous_hostnames FROM hosts WHERE mac_address = ?1",
        params![mac],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let current = split_list(current.as_deref());
    let previous = split_list(previous.as_deref());
    let (next_current, next_previous) = if current.iter().any(|h| h == hostname) {
        let mut reordered = vec![hostname.to_string()];
        reordered.extend(current.into_iter().filter(|h| h != hostname));
        (reordered, previous)
    } else {
        let rolled = diff_and_roll(&current, &previous, [hostname.to_string()], HOSTNAMES_CAP);
        (rolled.current, rolled.previous)
    };
    conn.execute(
        "UPDATE hosts SET hostnames = ?2, previous_hostnames = ?3 WHERE mac_address = ?1",
        params![mac, join_list(&next_current), join_list(&next_previous)],
    )?;

    conn.execute(
        "UPDATE hostnames_history SET is_current = 0, last_seen = ?2 \
         WHERE mac_address = ?1 AND is_current = 1 AND hostname <> ?3",
        params![mac, now, hostname],
    )?;
    conn.execute(
        "INSERT INTO hostnames_history (mac_address, hostname, first_seen, last_seen, is_current) \
         VALUES (?1, ?2, ?3, ?3, 1) \
         ON CONFLICT(mac_address, hostname) DO UPDATE SET is_current = 1, last_seen = ?3",
        params![mac, hostname, now],
    )?;
    Ok(())
}

impl Store {
    /// Partial upsert. Missing or empty fields never erase stored values;
    /// use the `update_*_current` methods to track previous values.
    pub fn update_host(&self, mac: &str, update: &HostUpdate) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        let ips = update.ips.as_deref().and_then(|ips| {
            let mut ips: Vec<String> = ips
                .iter()
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect();
            sort_ips(&mut ips);
            ips.dedup();
            join_list(&ips)
        });
        let hostnames = update
            .hostnames
            .as_deref()
            .and_then(|h| join_list(&union_lists([h])));
        let ports = update.ports.as_deref().and_then(|p| {
            let mut p = p.to_vec();
            p.sort_unstable();
            p.dedup();
            join_list(&p)
        });
        let vendor = update.vendor.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let essid = update.essid.as_deref().map(str::trim).filter(|e| !e.is_empty());
        let alive = update.alive.map(i64::from);

        self.write(|tx| {
            tx.execute(
                "INSERT INTO hosts (mac_address, ips, hostnames, ports, vendor, essid, alive, \
                 first_seen, last_seen) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 1), ?8, ?8) \
                 ON CONFLICT(mac_address) DO UPDATE SET \
                   ips = COALESCE(excluded.ips, hosts.ips), \
                   hostnames = COALESCE(excluded.hostnames, hosts.hostnames), \
                   ports = COALESCE(excluded.ports, hosts.ports), \
                   vendor = COALESCE(excluded.vendor, hosts.vendor), \
                   essid = COALESCE(excluded.essid, hosts.essid), \
                   alive = COALESCE(?7, hosts.alive), \
                   last_seen = ?8",
                params![mac, ips, hostnames, ports, vendor, essid, alive, now],
            )?;
            Ok(())
        })?;
        debug!(mac = %mac, "host updated");
        Ok(())
    }

    /// Create the host row if needed and refresh `last_seen`.
    pub fn ensure_host(&self, mac: &str) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| touch_host_in(tx, &mac, now))
    }

    pub fn get_host(&self, mac: &str) -> Result<Option<Host>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| get_host_in(conn, &mac))
    }

    /// All hosts, alive first, most recently seen first.
    pub fn list_hosts(&self) -> Result<Vec<Host>, DbError> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {HOST_COLUMNS} FROM hosts \
                 ORDER BY alive DESC, COALESCE(last_seen, 0) DESC, mac_address ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], host_from_row)?;
            let mut hosts = Vec::new();
            for row in rows {
                hosts.push(row?);
            }
            Ok(hosts)
        })
    }

    pub fn set_alive(&self, mac: &str, alive: bool) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| {
            touch_host_in(tx, &mac, now)?;
            tx.execute(
                "UPDATE hosts SET alive = ?2 WHERE mac_address = ?1",
                params![mac, alive],
            )?;
            Ok(())
        })
    }

    /// Make `hostname` current, rolling the others into `previous_hostnames`
    /// and keeping `hostnames_history` in step.
    pub fn update_hostname(&self, mac: &str, hostname: &str) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Ok(());
        }
        let now = self.now();
        self.write(|tx| set_hostname_in(tx, &mac, hostname, now))
    }

    /// Hostname history, current first.
    pub fn hostname_history(&self, mac: &str) -> Result<Vec<HostnameRecord>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hostname, first_seen, last_seen, is_current FROM hostnames_history \
                 WHERE mac_address = ?1 ORDER BY is_current DESC, last_seen DESC, first_seen DESC",
            )?;
            let rows = stmt.query_map(params![mac], |r| {
                Ok(HostnameRecord {
                    hostname: r.get(0)?,
                    first_seen: r.get(1)?,
                    last_seen: r.get(2)?,
                    is_current: r.get::<_, i64>(3)? != 0,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Replace the current address set; dropped addresses roll into `previous_ips`.
    pub fn update_ips_current(
        &self,
        mac: &str,
        ips: &[String],
    ) -> Result<SetDiff<String>, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| roll_ips_in(tx, &mac, ips, now))
    }

    /// Replace the current port set; dropped ports roll into `previous_ports`.
    pub fn update_ports_current(&self, mac: &str, ports: &[u16]) -> Result<SetDiff<u16>, DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        self.write(|tx| roll_ports_in(tx, &mac, ports, now))
    }

    /// Set the current ESSID. A changed or cleared ESSID rolls the old one into `previous_essids`.
    pub fn update_essid_current(&self, mac: &str, essid: Option<&str>) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let essid = essid.map(str::trim).filter(|e| !e.is_empty());
        let now = self.now();
        self.write(|tx| {
            touch_host_in(tx, &mac, now)?;
            let (current, previous): (Option<String>, Option<String>) = tx.query_row(
                "SELECT essid, previous_essids FROM hosts WHERE mac_address = ?1",
                params![mac],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let current: Vec<String> = current
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .into_iter()
                .collect();
            let rolled = diff_and_roll(
                &current,
                &split_list(previous.as_deref()),
                essid.map(str::to_string),
                ESSIDS_CAP,
            );
            tx.execute(
                "UPDATE hosts SET essid = ?2, previous_essids = ?3 WHERE mac_address = ?1",
                params![mac, essid, join_list(&rolled.previous)],
            )?;
            Ok(())
        })
    }

    /// Reconcile the `ip:<addr>` stub for `ip` with the host at `real_mac`.
    ///
    /// Every table carrying a `mac_address` follows the stub to the real
    /// MAC. Rows that would collide with one the real host already has are
    /// dropped and logged.
    pub fn merge_ip_stub_into_real(
        &self,
        ip: &str,
        real_mac: &str,
        hostname: Option<&str>,
        essid_hint: Option<&str>,
    ) -> Result<MergeOutcome, DbError> {
        let real = writable_mac(real_mac)?;
        if !real.contains(':') {
            return Err(DbError::InvalidInput(format!("{real} is not a MAC address")));
        }
        let ip = ip.trim().to_string();
        if ip.is_empty() {
            return Err(DbError::InvalidInput("stub merge needs an IP".into()));
        }
        let stub_key = stub_mac_for(&ip).to_ascii_lowercase();
        let hostname: Vec<String> = hostname
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .into_iter()
            .collect();
        let essid_hint = essid_hint.map(str::trim).filter(|e| !e.is_empty());
        let now = self.now();

        let outcome = self.write(|tx| {
            let stub_mac: Option<String> = tx
                .query_row(
                    "SELECT mac_address FROM hosts \
                     WHERE lower(mac_address) = ?1 \
                        OR (lower(mac_address) LIKE 'ip:%' \
                            AND ';' || COALESCE(ips, '') || ';' LIKE '%;' || ?2 || ';%') \
                     ORDER BY lower(mac_address) = ?1 DESC LIMIT 1",
                    params![stub_key, ip],
                    |r| r.get(0),
                )
                .optional()?;
            let stub = match &stub_mac {
                Some(m) => get_host_in(tx, m)?,
                None => None,
            };
            let existing = get_host_in(tx, &real)?;
            let ip_list = [ip.clone()];

            match (stub, existing) {
                (None, None) => {
                    tx.execute(
                        "INSERT INTO hosts (mac_address, ips, hostnames, essid, alive, \
                         first_seen, last_seen) \
                         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                        params![real, ip, join_list(&hostname), essid_hint, now],
                    )?;
                    Ok(MergeOutcome::Created)
                }
                (Some(stub), None) => {
                    let mut ips = union_lists([stub.ips.as_slice(), ip_list.as_slice()]);
                    sort_ips(&mut ips);
                    let hostnames = union_lists([stub.hostnames.as_slice(), hostname.as_slice()]);
                    let essid = stub.essid.as_deref().or(essid_hint);
                    tx.execute(
                        "UPDATE hosts SET mac_address = ?1, ips = ?2, hostnames = ?3, \
                         essid = COALESCE(?4, essid), alive = 1, last_seen = ?5 \
                         WHERE mac_address = ?6",
                        params![
                            real,
                            join_list(&ips),
                            join_list(&hostnames),
                            essid,
                            now,
                            stub.mac_address
                        ],
                    )?;
                    redirect_mac_references(tx, &stub.mac_address, &real)?;
                    Ok(MergeOutcome::Renamed)
                }
                (Some(stub), Some(host)) => {
                    let mut ips =
                        union_lists([host.ips.as_slice(), stub.ips.as_slice(), ip_list.as_slice()]);
                    sort_ips(&mut ips);
                    let hostnames = union_lists([
                        host.hostnames.as_slice(),
                        stub.hostnames.as_slice(),
                        hostname.as_slice(),
                    ]);
                    let mut ports = host.ports.clone();
                    ports.extend(stub.ports.iter().copied());
                    ports.sort_unstable();
                    ports.dedup();
                    let vendor = host.vendor.clone().or(stub.vendor.clone());
                    let essid = host
                        .essid
                        .clone()
                        .or(stub.essid.clone())
                        .or(essid_hint.map(str::to_string));
                    let first_seen = host
                        .first_seen
                        .unwrap_or(now)
                        .min(stub.first_seen.unwrap_or(now));
                    let last_seen = host
                        .last_seen
                        .unwrap_or(now)
                        .max(stub.last_seen.unwrap_or(now))
                        .max(now);
                    tx.execute(
                        "UPDATE hosts SET ips = ?2, hostnames = ?3, ports = ?4, \
                         vendor = COALESCE(?5, vendor), essid = COALESCE(?6, essid), alive = 1, \
                         first_seen = ?7, last_seen = ?8 WHERE mac_address = ?1",
                        params![
                            real,
                            join_list(&ips),
                            join_list(&hostnames),
                            join_list(&ports),
                            vendor,
                            essid,
                            first_seen,
                            last_seen
                        ],
                    )?;
                    redirect_mac_references(tx, &stub.mac_address, &real)?;
                    tx.execute(
                        "DELETE FROM hosts WHERE mac_address = ?1",
                        params![stub.mac_address],
                    )?;
                    Ok(MergeOutcome::Merged)
                }
                (None, Some(host)) => {
                    let mut ips = union_lists([host.ips.as_slice(), ip_list.as_slice()]);
                    sort_ips(&mut ips);
                    let hostnames = union_lists([host.hostnames.as_slice(), hostname.as_slice()]);
                    tx.execute(
                        "UPDATE hosts SET ips = ?2, hostnames = ?3, essid = COALESCE(essid, ?4), \
                         alive = 1, last_seen = ?5 WHERE mac_address = ?1",
                        params![real, join_list(&ips), join_list(&hostnames), essid_hint, now],
                    )?;
                    Ok(MergeOutcome::Refreshed)
                }
            }
        })?;
        debug!(ip = %ip, mac = %real, ?outcome, "stub reconciled");
        Ok(outcome)
    }
}

fn redirect_mac_references(conn: &Connection, old_mac: &str, new_mac: &str) -> Result<(), DbError> {
    for table in MAC_REFERENCES {
        conn.execute(
            &format!("UPDATE OR IGNORE {table} SET mac_address = ?1 WHERE mac_address = ?2"),
            params![new_mac, old_mac],
        )?;
        let dropped = conn.execute(
            &format!("DELETE FROM {table} WHERE mac_address = ?1"),
            params![old_mac],
        )?;
        if dropped > 0 {
            warn!(table, dropped, from = old_mac, to = new_mac, "dropped rows duplicated by merge");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use rustrecon_types::{NewQueueItem, PortServiceUpdate};
    use std::sync::Arc;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn store() -> (Store, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store =
            Store::open_in_memory_with(StoreConfig::default(), Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn update_host_never_erases_with_empty_fields() {
        let (store, clock) = store();
        store
            .update_host(MAC, &HostUpdate::default().ip("10.0.0.5").vendor("Acme"))
            .unwrap();
        clock.advance(10);
        store
            .update_host(
                MAC,
                &HostUpdate {
                    ips: Some(vec![]),
                    vendor: Some("  ".into()),
                    alive: Some(false),
                    ..HostUpdate::default()
                },
            )
            .unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.ips, strings(&["10.0.0.5"]));
        assert_eq!(host.vendor.as_deref(), Some("Acme"));
        assert!(!host.alive);
        assert_eq!(host.first_seen, Some(1_000));
        assert_eq!(host.last_seen, Some(1_010));
    }

    #[test]
    fn stub_macs_are_refused_for_writes() {
        let (store, _clock) = store();
        assert!(matches!(
            store.update_host("IP:10.0.0.9", &HostUpdate::default()),
            Err(DbError::InvalidInput(_))
        ));
        assert!(matches!(store.ensure_host(""), Err(DbError::InvalidInput(_))));
    }

    #[test]
    fn ports_roll_idempotently() {
        let (store, _clock) = store();
        store.update_ports_current(MAC, &[22, 80, 443]).unwrap();
        let diff = store.update_ports_current(MAC, &[80, 443, 8080]).unwrap();
        assert_eq!(diff.removed, vec![22]);
        assert_eq!(diff.added, vec![8080]);
        let first = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(first.ports, vec![80, 443, 8080]);
        assert_eq!(first.previous_ports, vec![22]);

        let again = store.update_ports_current(MAC, &[80, 443, 8080]).unwrap();
        assert!(again.is_unchanged());
        let second = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(second.previous_ports, first.previous_ports);
    }

    #[test]
    fn ips_are_sorted_numerically() {
        let (store, _clock) = store();
        store
            .update_ips_current(MAC, &strings(&["10.0.0.10", "10.0.0.2"]))
            .unwrap();
        store.update_ips_current(MAC, &strings(&["10.0.0.3"])).unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.ips, strings(&["10.0.0.3"]));
        assert_eq!(host.previous_ips, strings(&["10.0.0.10", "10.0.0.2"]));
    }

    #[test]
    fn hostname_changes_roll_and_track_history() {
        let (store, clock) = store();
        store.update_hostname(MAC, "printer").unwrap();
        clock.advance(5);
        store.update_hostname(MAC, "printer-2").unwrap();
        clock.advance(5);
        store.update_hostname(MAC, "printer").unwrap();

        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.hostnames, strings(&["printer"]));
        assert_eq!(host.previous_hostnames, strings(&["printer-2", "printer"]));

        let history = store.hostname_history(MAC).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].hostname, "printer");
        assert!(history[0].is_current);
        assert_eq!(history[0].first_seen, 1_000);
        assert_eq!(history[0].last_seen, 1_010);
        assert!(!history[1].is_current);
    }

    #[test]
    fn essid_change_rolls_previous() {
        let (store, _clock) = store();
        store.update_essid_current(MAC, Some("HomeNet")).unwrap();
        store.update_essid_current(MAC, Some("HomeNet")).unwrap();
        store.update_essid_current(MAC, Some("Guest")).unwrap();
        store.update_essid_current(MAC, None).unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.essid, None);
        assert_eq!(host.previous_essids, strings(&["Guest", "HomeNet"]));
    }

    #[test]
    fn list_hosts_puts_alive_first() {
        let (store, clock) = store();
        store.update_host("aa:00:00:00:00:01", &HostUpdate::default().alive(false)).unwrap();
        clock.advance(1);
        store.update_host("aa:00:00:00:00:02", &HostUpdate::default()).unwrap();
        let hosts = store.list_hosts().unwrap();
        assert_eq!(hosts[0].mac_address, "aa:00:00:00:00:02");
        assert!(hosts[0].alive);
        assert!(!hosts[1].alive);
    }

    fn insert_stub(store: &Store, ip: &str) -> String {
        let stub = stub_mac_for(ip);
        store
            .execute_raw(&format!(
                "INSERT INTO hosts (mac_address, ips, hostnames, ports, vendor, alive, \
                 first_seen, last_seen) \
                 VALUES ('{stub}', '{ip}', 'old-name', '21;80', 'StubVendor', 1, 500, 900); \
                 INSERT INTO port_services (mac_address, port, protocol, first_seen, last_seen) \
                 VALUES ('{stub}', 21, 'tcp', 500, 900); \
                 INSERT INTO vulnerabilities (mac_address, port, vuln_id, first_seen, last_seen) \
                 VALUES ('{stub}', 21, 'CVE-2011-2523', 500, 900);"
            ))
            .unwrap();
        stub
    }

    #[test]
    fn merge_renames_stub_when_real_is_unknown() {
        let (store, _clock) = store();
        let stub = insert_stub(&store, "10.0.0.7");
        let outcome = store
            .merge_ip_stub_into_real("10.0.0.7", MAC, Some("nas"), Some("HomeNet"))
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Renamed);
        assert!(store.get_host(&stub).unwrap().is_none());
        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.hostnames, strings(&["old-name", "nas"]));
        assert_eq!(host.essid.as_deref(), Some("HomeNet"));
        assert_eq!(store.services_for_host(MAC).unwrap().len(), 1);
        assert_eq!(store.list_vulnerabilities(Some(MAC), false).unwrap().len(), 1);
    }

    #[test]
    fn merge_unifies_stub_into_existing_host() {
        let (store, _clock) = store();
        store
            .update_host(MAC, &HostUpdate::default().ip("10.0.0.8").vendor("RealVendor"))
            .unwrap();
        store
            .upsert_port_service(MAC, 21, &PortServiceUpdate::open("ftp"))
            .unwrap();
        store
            .enqueue_immediate(NewQueueItem::immediate("FTPBrute", "ip:10.0.0.7", None))
            .unwrap();
        let stub = insert_stub(&store, "10.0.0.7");

        let outcome = store
            .merge_ip_stub_into_real("10.0.0.7", MAC, None, None)
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(store.get_host(&stub).unwrap().is_none());

        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.ips, strings(&["10.0.0.7", "10.0.0.8"]));
        assert_eq!(host.vendor.as_deref(), Some("RealVendor"));
        assert_eq!(host.first_seen, Some(500));
        assert!(host.ports.contains(&80));
        // The stub's port 21 row collided with the real one and was dropped.
        assert_eq!(store.services_for_host(MAC).unwrap().len(), 1);
        let queued = store.list_action_queue(&[]).unwrap();
        assert_eq!(queued[0].mac_address, MAC);
    }

    #[test]
    fn merge_without_stub_creates_or_refreshes() {
        let (store, _clock) = store();
        assert_eq!(
            store.merge_ip_stub_into_real("10.0.0.9", MAC, Some("cam"), None).unwrap(),
            MergeOutcome::Created
        );
        assert_eq!(
            store.merge_ip_stub_into_real("10.0.0.10", MAC, None, None).unwrap(),
            MergeOutcome::Refreshed
        );
        let host = store.get_host(MAC).unwrap().unwrap();
        assert_eq!(host.ips, strings(&["10.0.0.9", "10.0.0.10"]));
        assert!(matches!(
            store.merge_ip_stub_into_real("10.0.0.9", "ip:10.0.0.9", None, None),
            Err(DbError::InvalidInput(_))
        ));
    }
}
