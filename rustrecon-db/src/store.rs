use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rustrecon_types::DisplayStats;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::DbError;
use crate::schema;

const BUSY_BACKOFF_BASE: Duration = Duration::from_millis(10);
const BUSY_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Shared handle to the recon database.
///
/// One SQLite connection guarded by a mutex; clone an `Arc<Store>` to share it
/// between tasks. Separate handles (or processes) on the same file coordinate
/// through SQLite's own locking: every write runs in a `BEGIN IMMEDIATE`
/// transaction that is retried with backoff while the database is busy.
pub struct Store {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    stats_cache: Mutex<Option<(Instant, DisplayStats)>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub fn default_db_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("rustrecon").join("rustrecon.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".rustrecon").join("rustrecon.db")
    }
}

impl Store {
    /// Open (or create) the database at the default location.
    pub fn open_default() -> Result<Self, DbError> {
        Self::open(&default_db_path())
    }

    /// Open a database at a specific path.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::open_with(path, StoreConfig::default(), Arc::new(SystemClock))
    }

    /// Open a database with explicit tuning and time source.
    pub fn open_with(
        path: &Path,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Other(format!(
                    "failed to create db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn, &config)?;
        debug!(path = %path.display(), "recon database opened");
        Ok(Self::from_connection(conn, config, clock))
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::open_in_memory_with(StoreConfig::default(), Arc::new(SystemClock))
    }

    pub fn open_in_memory_with(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn, &config)?;
        Ok(Self::from_connection(conn, config, clock))
    }

    fn from_connection(conn: Connection, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock,
            config,
            stats_cache: Mutex::new(None),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run read-only statements on the connection.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// The whole closure is replayed when SQLite reports the database busy,
    /// so it must not have side effects outside the transaction. Any
    /// committed write drops the cached display stats.
    pub(crate) fn write<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let mut conn = self.lock()?;
        let mut attempt: u32 = 0;
        loop {
            match run_immediate(&mut conn, &mut f) {
                Ok(value) => {
                    drop(conn);
                    self.invalidate_stats_cache();
                    return Ok(value);
                }
                Err(e) if e.is_busy() && attempt < self.config.busy_retries => {
                    attempt += 1;
                    let delay = busy_backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "database busy, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_busy() => {
                    warn!(attempts = attempt + 1, "database busy, giving up");
                    return Err(DbError::Busy {
                        attempts: attempt + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop cached display stats so the next read recomputes them.
    pub fn invalidate_stats_cache(&self) {
        if let Ok(mut cache) = self.stats_cache.lock() {
            *cache = None;
        }
    }

    pub(crate) fn cached_stats(&self) -> Option<DisplayStats> {
        let cache = self.stats_cache.lock().ok()?;
        match *cache {
            Some((at, stats)) if at.elapsed() < self.config.stats_ttl() => Some(stats),
            _ => None,
        }
    }

    pub(crate) fn store_cached_stats(&self, stats: DisplayStats) {
        if let Ok(mut cache) = self.stats_cache.lock() {
            *cache = Some((Instant::now(), stats));
        }
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), DbError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

fn run_immediate<T>(
    conn: &mut Connection,
    f: &mut impl FnMut(&Transaction<'_>) -> Result<T, DbError>,
) -> Result<T, DbError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Exponential backoff with full jitter on the upper half.
fn busy_backoff(attempt: u32) -> Duration {
    let exp = BUSY_BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(BUSY_BACKOFF_CAP);
    let half = capped.as_millis() as u64 / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("recon.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        drop(store);
        // Reopening runs migrations again without error.
        Store::open(&path).unwrap();
    }

    #[test]
    fn busy_backoff_stays_within_cap() {
        for attempt in 0..40 {
            let d = busy_backoff(attempt);
            assert!(d <= BUSY_BACKOFF_CAP, "attempt {attempt}: {d:?}");
        }
        assert!(busy_backoff(1) >= Duration::from_millis(10));
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), DbError> = store.write(|tx| {
            tx.execute(
                "INSERT INTO hosts (mac_address, alive) VALUES ('aa:bb:cc:dd:ee:01', 1)",
                [],
            )?;
            Err(DbError::Other("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM hosts", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
