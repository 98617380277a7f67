use rusqlite::Connection;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::DbError;
use crate::{software, vulns};

const SCHEMA_SQL: &str = r#"
-- Known endpoints. List columns hold semicolon-joined values.
CREATE TABLE IF NOT EXISTS hosts (
    mac_address        TEXT PRIMARY KEY,
    ips                TEXT,
    previous_ips       TEXT,
    hostnames          TEXT,
    previous_hostnames TEXT,
    ports              TEXT,
    previous_ports     TEXT,
    vendor             TEXT,
    essid              TEXT,
    previous_essids    TEXT,
    alive              INTEGER NOT NULL DEFAULT 1,
    first_seen         INTEGER,
    last_seen          INTEGER
);
CREATE INDEX IF NOT EXISTS idx_hosts_alive ON hosts(alive);

-- Every hostname ever observed per MAC; exactly one is current
CREATE TABLE IF NOT EXISTS hostnames_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    hostname    TEXT NOT NULL,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_current  INTEGER NOT NULL DEFAULT 1,
    UNIQUE(mac_address, hostname)
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_hostname_current
    ON hostnames_history(mac_address) WHERE is_current = 1;

-- Current fingerprint per (mac, port, protocol)
CREATE TABLE IF NOT EXISTS port_services (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    port        INTEGER NOT NULL,
    protocol    TEXT NOT NULL DEFAULT 'tcp',
    state       TEXT NOT NULL DEFAULT 'open',
    service     TEXT,
    product     TEXT,
    version     TEXT,
    banner      TEXT,
    fingerprint TEXT,
    confidence  REAL,
    source      TEXT NOT NULL DEFAULT 'scan',
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_current  INTEGER NOT NULL DEFAULT 1,
    UNIQUE(mac_address, port, protocol)
);
CREATE INDEX IF NOT EXISTS idx_ps_service ON port_services(service);
CREATE INDEX IF NOT EXISTS idx_ps_state ON port_services(state);

-- Append-only fingerprint changes
CREATE TABLE IF NOT EXISTS port_service_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    port        INTEGER NOT NULL,
    protocol    TEXT NOT NULL,
    state       TEXT NOT NULL,
    service     TEXT,
    product     TEXT,
    version     TEXT,
    banner      TEXT,
    fingerprint TEXT,
    confidence  REAL,
    source      TEXT,
    seen_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_psh_key ON port_service_history(mac_address, port, protocol);

-- Vulnerability presence per (mac, vuln_id, port); port 0 = host-wide
CREATE TABLE IF NOT EXISTS vulnerabilities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    hostname    TEXT,
    port        INTEGER DEFAULT 0,
    vuln_id     TEXT NOT NULL,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_vuln_mac ON vulnerabilities(mac_address);
CREATE INDEX IF NOT EXISTS idx_vuln_active ON vulnerabilities(is_active);

CREATE TABLE IF NOT EXISTS vulnerability_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    hostname    TEXT,
    port        INTEGER DEFAULT 0,
    vuln_id     TEXT NOT NULL,
    event       TEXT NOT NULL,
    seen_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vh_vuln ON vulnerability_history(vuln_id);
CREATE INDEX IF NOT EXISTS idx_vh_mac ON vulnerability_history(mac_address);

-- Software presence per (mac, cpe, port)
CREATE TABLE IF NOT EXISTS detected_software (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    hostname    TEXT,
    port        INTEGER DEFAULT 0,
    cpe         TEXT NOT NULL,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_sw_mac ON detected_software(mac_address);

CREATE TABLE IF NOT EXISTS detected_software_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    ip          TEXT,
    hostname    TEXT,
    port        INTEGER DEFAULT 0,
    cpe         TEXT NOT NULL,
    event       TEXT NOT NULL,
    seen_at     INTEGER NOT NULL
);

-- Recovered credentials
CREATE TABLE IF NOT EXISTS creds (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    service     TEXT NOT NULL,
    mac_address TEXT,
    ip          TEXT,
    hostname    TEXT,
    "user"      TEXT,
    password    TEXT,
    port        INTEGER,
    "database"  TEXT,
    extra       TEXT,
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_creds_mac_service ON creds(mac_address, service);

-- Action catalog
CREATE TABLE IF NOT EXISTS actions (
    name          TEXT PRIMARY KEY,
    module        TEXT,
    port          INTEGER,
    services      TEXT NOT NULL DEFAULT '[]',
    trigger_spec  TEXT,
    requires      TEXT,
    priority      INTEGER NOT NULL DEFAULT 50,
    timeout_secs  INTEGER NOT NULL DEFAULT 300,
    max_retries   INTEGER NOT NULL DEFAULT 3,
    cooldown_secs INTEGER NOT NULL DEFAULT 0,
    rate_limit    TEXT,
    stealth_level INTEGER NOT NULL DEFAULT 5,
    risk_level    TEXT NOT NULL DEFAULT 'medium',
    enabled       INTEGER NOT NULL DEFAULT 1,
    scope         TEXT NOT NULL DEFAULT 'normal',
    tags          TEXT NOT NULL DEFAULT '[]',
    args          TEXT,
    description   TEXT,
    updated_at    INTEGER NOT NULL
);

-- Action queue: every scheduled, waiting, running and finished attempt
CREATE TABLE IF NOT EXISTS action_queue (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    action_name    TEXT NOT NULL,
    mac_address    TEXT NOT NULL,
    ip             TEXT,
    port           INTEGER,
    hostname       TEXT,
    service        TEXT,
    priority       INTEGER NOT NULL DEFAULT 50,
    status         TEXT NOT NULL DEFAULT 'pending',
    retry_count    INTEGER NOT NULL DEFAULT 0,
    max_retries    INTEGER NOT NULL DEFAULT 3,
    created_at     INTEGER NOT NULL,
    scheduled_for  INTEGER,
    started_at     INTEGER,
    completed_at   INTEGER,
    expires_at     INTEGER,
    trigger_source TEXT,
    dependencies   TEXT,
    conditions     TEXT,
    result_summary TEXT,
    error_message  TEXT,
    tags           TEXT,
    metadata       TEXT,
    CHECK (retry_count <= max_retries)
);
CREATE INDEX IF NOT EXISTS idx_queue_status_priority
    ON action_queue(status, priority DESC, scheduled_for, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_key
    ON action_queue(action_name, mac_address, port);
CREATE INDEX IF NOT EXISTS idx_queue_mac_action
    ON action_queue(mac_address, action_name, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_queue_scheduled_for
    ON action_queue(scheduled_for) WHERE status = 'scheduled';

-- Precomputed counters (singleton)
CREATE TABLE IF NOT EXISTS stats (
    id                    INTEGER PRIMARY KEY CHECK (id = 1),
    total_open_ports      INTEGER NOT NULL DEFAULT 0,
    alive_hosts_count     INTEGER NOT NULL DEFAULT 0,
    all_known_hosts_count INTEGER NOT NULL DEFAULT 0,
    vulnerabilities_count INTEGER NOT NULL DEFAULT 0,
    actions_count         INTEGER NOT NULL DEFAULT 0,
    zombie_count          INTEGER NOT NULL DEFAULT 0,
    updated_at            INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO stats (id) VALUES (1);
"#;

/// Unique indexes that legacy databases may violate until their rows are repaired.
const IDENTITY_INDEXES_SQL: &str = r#"
-- At most one upcoming run per target key
CREATE UNIQUE INDEX IF NOT EXISTS uq_next_scheduled
    ON action_queue(action_name, COALESCE(mac_address, ''), COALESCE(service, ''),
                    COALESCE(port, -1))
    WHERE status = 'scheduled';
CREATE UNIQUE INDEX IF NOT EXISTS uq_vuln_identity
    ON vulnerabilities(mac_address, vuln_id, port);
CREATE UNIQUE INDEX IF NOT EXISTS uq_software_identity
    ON detected_software(mac_address, cpe, port);
"#;

pub fn initialize(conn: &Connection, config: &StoreConfig) -> Result<(), DbError> {
    // WAL + foreign keys before any DDL. journal_mode is a no-op for :memory:.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(config.busy_timeout())?;
    conn.execute_batch(SCHEMA_SQL)?;

    // Safe migration: columns added after the first release.
    // Only swallow "duplicate column name" errors; propagate other DB errors.
    for stmt in &[
        "ALTER TABLE action_queue ADD COLUMN service TEXT",
        "ALTER TABLE action_queue ADD COLUMN expires_at INTEGER",
        "ALTER TABLE action_queue ADD COLUMN tags TEXT",
        "ALTER TABLE action_queue ADD COLUMN metadata TEXT",
        "ALTER TABLE hosts ADD COLUMN previous_essids TEXT",
        "ALTER TABLE port_services ADD COLUMN confidence REAL",
        "ALTER TABLE stats ADD COLUMN zombie_count INTEGER NOT NULL DEFAULT 0",
    ] {
        if let Err(e) = conn.execute(stmt, []) {
            let msg = e.to_string();
            if !msg.contains("duplicate column name") {
                return Err(e.into());
            }
        }
    }

    // Legacy rows stored NULL ports and duplicates; the identity indexes need them gone.
    let merged = vulns::collapse_duplicates(conn)? + software::collapse_duplicates(conn)?;
    let fixed = vulns::fix_history_nulls(conn)?
        + vulns::normalize_null_ports(conn)?
        + software::normalize_null_ports(conn)?;
    if fixed + merged > 0 {
        debug!(fixed, merged, "repaired legacy finding rows");
    }
    conn.execute_batch(IDENTITY_INDEXES_SQL)?;

    Ok(())
}
