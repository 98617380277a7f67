use rusqlite::{Connection, params};
use rustrecon_types::{DisplayStats, LiveStats};
use tracing::debug;

use crate::error::DbError;
use crate::rolling::split_ports;
use crate::store::Store;

fn count(conn: &Connection, sql: &str) -> Result<u64, DbError> {
    let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
    Ok(n.max(0) as u64)
}

fn read_livestats(conn: &Connection) -> Result<LiveStats, DbError> {
    Ok(conn.query_row(
        "SELECT total_open_ports, alive_hosts_count, all_known_hosts_count, vulnerabilities_count \
         FROM stats WHERE id = 1",
        [],
        |r| {
            Ok(LiveStats {
                total_open_ports: r.get::<_, i64>(0)?.max(0) as u64,
                alive_hosts_count: r.get::<_, i64>(1)?.max(0) as u64,
                all_known_hosts_count: r.get::<_, i64>(2)?.max(0) as u64,
                vulnerabilities_count: r.get::<_, i64>(3)?.max(0) as u64,
            })
        },
    )?)
}

fn write_livestats(conn: &Connection, stats: &LiveStats, now: i64) -> Result<(), DbError> {
    conn.execute(
        "UPDATE stats SET total_open_ports = ?1, alive_hosts_count = ?2, \
         all_known_hosts_count = ?3, vulnerabilities_count = ?4, updated_at = ?5 WHERE id = 1",
        params![
            stats.total_open_ports as i64,
            stats.alive_hosts_count as i64,
            stats.all_known_hosts_count as i64,
            stats.vulnerabilities_count as i64,
            now
        ],
    )?;
    Ok(())
}

impl Store {
    /// Counters as last persisted in the stats row.
    pub fn get_livestats(&self) -> Result<LiveStats, DbError> {
        self.read(read_livestats)
    }

    pub fn update_livestats(&self, stats: &LiveStats) -> Result<(), DbError> {
        let now = self.now();
        self.write(|tx| write_livestats(tx, stats, now))
    }

    /// Derive the live counters from the inventory tables and persist them.
    ///
    /// Open ports are summed over alive hosts; vulnerabilities count active
    /// rows on alive hosts.
    pub fn recompute_livestats(&self) -> Result<LiveStats, DbError> {
        let now = self.now();
        let stats = self.write(|tx| {
            let mut stmt = tx.prepare("SELECT ports FROM hosts WHERE alive = 1")?;
            let port_lists = stmt.query_map([], |r| r.get::<_, Option<String>>(0))?;
            let mut total_open_ports = 0u64;
            for ports in port_lists {
                total_open_ports += split_ports(ports?.as_deref()).len() as u64;
            }
            drop(stmt);
            let stats = LiveStats {
                total_open_ports,
                alive_hosts_count: count(tx, "SELECT COUNT(*) FROM hosts WHERE alive = 1")?,
                all_known_hosts_count: count(tx, "SELECT COUNT(*) FROM hosts")?,
                vulnerabilities_count: count(
                    tx,
                    "SELECT COUNT(*) FROM vulnerabilities v \
                     JOIN hosts h ON h.mac_address = v.mac_address \
                     WHERE h.alive = 1 AND v.is_active = 1",
                )?,
            };
            write_livestats(tx, &stats, now)?;
            Ok(stats)
        })?;
        debug!(?stats, "live stats recomputed");
        Ok(stats)
    }

    /// Dashboard counters, served from a short-lived cache.
    ///
    /// Any committed write through this handle drops the cache; writes from
    /// other handles show up once the TTL expires.
    pub fn get_display_stats(&self) -> Result<DisplayStats, DbError> {
        if let Some(stats) = self.cached_stats() {
            return Ok(stats);
        }
        let now = self.now();
        let stats = self.read(|conn| {
            let live = read_livestats(conn)?;
            let (actions_count, zombie_count): (i64, i64) = conn.query_row(
                "SELECT actions_count, zombie_count FROM stats WHERE id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let (pending, running, scheduled): (i64, i64, i64) = conn.query_row(
                "SELECT \
                   COALESCE(SUM(status = 'pending'), 0), \
                   COALESCE(SUM(status = 'running'), 0), \
                   COALESCE(SUM(status = 'scheduled'), 0) \
                 FROM action_queue WHERE status IN ('pending', 'running', 'scheduled')",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;
            Ok(DisplayStats {
                live,
                credentials_count: count(conn, "SELECT COUNT(*) FROM creds")?,
                actions_count: actions_count.max(0) as u64,
                zombie_count: zombie_count.max(0) as u64,
                pending_count: pending.max(0) as u64,
                running_count: running.max(0) as u64,
                scheduled_count: scheduled.max(0) as u64,
                updated_at: now,
            })
        })?;
        self.store_cached_stats(stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use rustrecon_types::{HostUpdate, NewCredential, NewQueueItem};
    use std::sync::Arc;

    fn store() -> (Store, ManualClock) {
        let clock = ManualClock::new(6_000);
        let store =
            Store::open_in_memory_with(StoreConfig::default(), Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    #[test]
    fn recompute_derives_from_inventory() {
        let (store, _clock) = store();
        store.update_ports_current("aa:00:00:00:00:01", &[22, 80]).unwrap();
        store.update_ports_current("aa:00:00:00:00:02", &[443]).unwrap();
        store.set_alive("aa:00:00:00:00:02", false).unwrap();
        store.add_vulnerability("aa:00:00:00:00:01", "CVE-1", None, None, Some(22)).unwrap();
        store.add_vulnerability("aa:00:00:00:00:02", "CVE-2", None, None, None).unwrap();

        let live = store.recompute_livestats().unwrap();
        assert_eq!(
            live,
            LiveStats {
                total_open_ports: 2,
                alive_hosts_count: 1,
                all_known_hosts_count: 2,
                vulnerabilities_count: 1,
            }
        );
        assert_eq!(store.get_livestats().unwrap(), live);
    }

    #[test]
    fn display_stats_cache_is_invalidated_by_writes() {
        let (store, _clock) = store();
        store
            .enqueue_immediate(NewQueueItem::immediate(
                "PortScan",
                "aa:bb:cc:dd:ee:ff",
                Some("10.0.0.5"),
            ))
            .unwrap();
        let first = store.get_display_stats().unwrap();
        assert_eq!(first.pending_count, 1);
        assert_eq!(first.updated_at, 6_000);

        // Raw SQL skips invalidation, so the cached value is still served.
        store.execute_raw("UPDATE stats SET zombie_count = 3 WHERE id = 1").unwrap();
        assert_eq!(store.get_display_stats().unwrap().zombie_count, 0);

        store
            .insert_cred(&NewCredential::new("ssh", "aa:bb:cc:dd:ee:ff").login("root", "root"))
            .unwrap();
        let refreshed = store.get_display_stats().unwrap();
        assert_eq!(refreshed.zombie_count, 3);
        assert_eq!(refreshed.credentials_count, 1);
    }

    #[test]
    fn update_livestats_persists_counters() {
        let (store, _clock) = store();
        store.update_host("aa:00:00:00:00:01", &HostUpdate::default()).unwrap();
        let stats = LiveStats {
            total_open_ports: 7,
            alive_hosts_count: 1,
            all_known_hosts_count: 1,
            vulnerabilities_count: 4,
        };
        store.update_livestats(&stats).unwrap();
        assert_eq!(store.get_display_stats().unwrap().live, stats);
    }
}
