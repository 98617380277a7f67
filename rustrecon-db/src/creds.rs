use rusqlite::{OptionalExtension, params};
use rustrecon_types::{Credential, NewCredential, normalize_mac};
use tracing::debug;

use crate::error::DbError;
use crate::hosts::writable_mac;
use crate::store::Store;

fn blank_to_none(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Store {
    /// Record a credential. The identity is `(service, mac, ip, user,
    /// database, port)` with NULLs compared as equal; a repeat sighting
    /// refreshes the password and `last_seen`. Returns the row id.
    pub fn insert_cred(&self, cred: &NewCredential) -> Result<i64, DbError> {
        let service = cred.service.trim();
        if service.is_empty() {
            return Err(DbError::InvalidInput("credential service is required".into()));
        }
        let mac = match blank_to_none(cred.mac_address.as_deref()) {
            Some(mac) => Some(writable_mac(mac)?),
            None => None,
        };
        let ip = blank_to_none(cred.ip.as_deref());
        let user = blank_to_none(cred.user.as_deref());
        let database = blank_to_none(cred.database.as_deref());
        let hostname = blank_to_none(cred.hostname.as_deref());
        let extra = cred.extra.as_ref().map(serde_json::to_string).transpose()?;
        let now = self.now();

        let id = self.write(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM creds WHERE service = ?1 AND mac_address IS ?2 AND ip IS ?3 \
                     AND \"user\" IS ?4 AND \"database\" IS ?5 AND port IS ?6 LIMIT 1",
                    params![service, mac, ip, user, database, cred.port],
                    |r| r.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE creds SET password = ?2, hostname = COALESCE(?3, hostname), \
                         extra = COALESCE(?4, extra), last_seen = ?5 WHERE id = ?1",
                        params![id, cred.password, hostname, extra, now],
                    )?;
                    Ok(id)
                }
                None => {
                    tx.execute(
                        "INSERT INTO creds (service, mac_address, ip, hostname, \"user\", \
                         password, port, \"database\", extra, first_seen, last_seen) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                        params![
                            service,
                            mac,
                            ip,
                            hostname,
                            user,
                            cred.password,
                            cred.port,
                            database,
                            extra,
                            now
                        ],
                    )?;
                    Ok(tx.last_insert_rowid())
                }
            }
        })?;
        debug!(id, service, "credential stored");
        Ok(id)
    }

    /// Credentials grouped for display: by service, address, user, port.
    pub fn list_creds(&self) -> Result<Vec<Credential>, DbError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, service, mac_address, ip, hostname, \"user\", password, port, \
                 \"database\", extra, first_seen, last_seen FROM creds \
                 ORDER BY service, ip, \"user\", port",
            )?;
            let rows = stmt.query_map([], |r| {
                let extra: Option<String> = r.get(9)?;
                Ok(Credential {
                    id: r.get(0)?,
                    service: r.get(1)?,
                    mac_address: r.get(2)?,
                    ip: r.get(3)?,
                    hostname: r.get(4)?,
                    user: r.get(5)?,
                    password: r.get(6)?,
                    port: r.get(7)?,
                    database: r.get(8)?,
                    extra: extra.and_then(|e| serde_json::from_str(&e).ok()),
                    first_seen: r.get(10)?,
                    last_seen: r.get(11)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Whether any credential is known for the host, optionally for one service.
    pub fn has_cred(&self, mac: &str, service: Option<&str>) -> Result<bool, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM creds WHERE mac_address = ?1 \
                 AND (?2 IS NULL OR lower(service) = lower(?2)))",
                params![mac, service],
                |r| r.get(0),
            )?)
        })
    }

    pub fn count_creds(&self) -> Result<u64, DbError> {
        self.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM creds", [], |r| r.get(0))?;
            Ok(n as u64)
        })
    }
}
