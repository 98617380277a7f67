use rusqlite::{OptionalExtension, Row, params};
use rustrecon_types::{
    PortService, PortServiceChange, PortServiceUpdate, PortState, Protocol, normalize_mac,
    well_known_ports,
};
use tracing::debug;

use crate::error::DbError;
use crate::hosts::{get_host_in, roll_ports_in, touch_host_in, writable_mac};
use crate::store::Store;

const SERVICE_COLUMNS: &str = "mac_address, ip, port, protocol, state, service, product, version, \
     banner, fingerprint, confidence, source, first_seen, last_seen, is_current";

fn parse_column<T: std::str::FromStr>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<PortService> {
    Ok(PortService {
        mac_address: row.get(0)?,
        ip: row.get(1)?,
        port: row.get(2)?,
        protocol: parse_column(3, row.get(3)?)?,
        state: parse_column(4, row.get(4)?)?,
        service: row.get(5)?,
        product: row.get(6)?,
        version: row.get(7)?,
        banner: row.get(8)?,
        fingerprint: row.get(9)?,
        confidence: row.get(10)?,
        source: row.get(11)?,
        first_seen: row.get(12)?,
        last_seen: row.get(13)?,
        is_current: row.get::<_, i64>(14)? != 0,
    })
}

/// Whether the stored fingerprint differs from the observation.
/// A missing confidence never counts as a change.
fn fingerprint_changed(stored: &PortService, update: &PortServiceUpdate) -> bool {
    stored.state != update.state
        || stored.service != update.service
        || stored.product != update.product
        || stored.version != update.version
        || stored.banner != update.banner
        || stored.fingerprint != update.fingerprint
        || update
            .confidence
            .is_some_and(|c| stored.confidence != Some(c))
}

impl Store {
    /// Record the current fingerprint of one port.
    ///
    /// A history row is written only when an existing fingerprint changes.
    /// `hosts.ports` is then rebuilt from the open TCP services, so closed
    /// ports roll into `previous_ports`.
    pub fn upsert_port_service(
        &self,
        mac: &str,
        port: u16,
        update: &PortServiceUpdate,
    ) -> Result<(), DbError> {
        let mac = writable_mac(mac)?;
        let now = self.now();
        let protocol = update.protocol.to_string();
        let state = update.state.to_string();

        let changed = self.write(|tx| {
            touch_host_in(tx, &mac, now)?;
            let sql = format!(
                "SELECT {SERVICE_COLUMNS} FROM port_services \
                 WHERE mac_address = ?1 AND port = ?2 AND protocol = ?3"
            );
            let stored = tx
                .query_row(&sql, params![mac, port, protocol], service_from_row)
                .optional()?;

            let changed = match &stored {
                Some(prev) => {
                    let changed = fingerprint_changed(prev, update);
                    if changed {
                        tx.execute(
                            "INSERT INTO port_service_history (mac_address, ip, port, protocol, \
                             state, service, product, version, banner, fingerprint, confidence, \
                             source, seen_at) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                            params![
                                mac,
                                update.ip,
                                port,
                                protocol,
                                state,
                                update.service,
                                update.product,
                                update.version,
                                update.banner,
                                update.fingerprint,
                                update.confidence,
                                update.source,
                                now
                            ],
                        )?;
                    }
                    tx.execute(
                        "UPDATE port_services SET ip = COALESCE(?4, ip), state = ?5, service = ?6, \
                         product = ?7, version = ?8, banner = ?9, fingerprint = ?10, \
                         confidence = COALESCE(?11, confidence), source = ?12, last_seen = ?13, \
                         is_current = 1 \
                         WHERE mac_address = ?1 AND port = ?2 AND protocol = ?3",
                        params![
                            mac,
                            port,
                            protocol,
                            update.ip,
                            state,
                            update.service,
                            update.product,
                            update.version,
                            update.banner,
                            update.fingerprint,
                            update.confidence,
                            update.source,
                            now
                        ],
                    )?;
                    changed
                }
                None => {
                    tx.execute(
                        "INSERT INTO port_services (mac_address, ip, port, protocol, state, \
                         service, product, version, banner, fingerprint, confidence, source, \
                         first_seen, last_seen) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                        params![
                            mac,
                            update.ip,
                            port,
                            protocol,
                            state,
                            update.service,
                            update.product,
                            update.version,
                            update.banner,
                            update.fingerprint,
                            update.confidence,
                            update.source,
                            now
                        ],
                    )?;
                    true
                }
            };

            let mut stmt = tx.prepare(
                "SELECT port FROM port_services \
                 WHERE mac_address = ?1 AND state = 'open' AND protocol = 'tcp'",
            )?;
            let open: Vec<u16> = stmt
                .query_map(params![mac], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            roll_ports_in(tx, &mac, &open, now)?;
            Ok(changed)
        })?;

        if changed {
            debug!(
                mac = %mac,
                port,
                protocol = %update.protocol,
                state = %update.state,
                "port service changed"
            );
        }
        Ok(())
    }

    /// All fingerprint rows for a host, by port.
    pub fn services_for_host(&self, mac: &str) -> Result<Vec<PortService>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            let sql = format!(
                "SELECT {SERVICE_COLUMNS} FROM port_services \
                 WHERE mac_address = ?1 ORDER BY port, protocol"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![mac], service_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Distinct MACs exposing `service` on an open port.
    pub fn find_hosts_by_service(&self, service: &str) -> Result<Vec<String>, DbError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT mac_address FROM port_services \
                 WHERE service = ?1 AND state = 'open' ORDER BY mac_address",
            )?;
            let rows = stmt.query_map(params![service], |r| r.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
    }

    pub fn service_for_host_port(
        &self,
        mac: &str,
        port: u16,
        protocol: Protocol,
    ) -> Result<Option<PortService>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            let sql = format!(
                "SELECT {SERVICE_COLUMNS} FROM port_services \
                 WHERE mac_address = ?1 AND port = ?2 AND protocol = ?3"
            );
            Ok(conn
                .query_row(&sql, params![mac, port, protocol.to_string()], service_from_row)
                .optional()?)
        })
    }

    /// Fingerprint changes for one port, newest first.
    pub fn port_service_history(
        &self,
        mac: &str,
        port: u16,
    ) -> Result<Vec<PortServiceChange>, DbError> {
        let mac = normalize_mac(mac);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT port, protocol, state, service, product, version, seen_at \
                 FROM port_service_history WHERE mac_address = ?1 AND port = ?2 \
                 ORDER BY seen_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![mac, port], |r| {
                Ok(PortServiceChange {
                    port: r.get(0)?,
                    protocol: parse_column(1, r.get(1)?)?,
                    state: parse_column(2, r.get(2)?)?,
                    service: r.get(3)?,
                    product: r.get(4)?,
                    version: r.get(5)?,
                    seen_at: r.get(6)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// First open port serving `service` on a host.
    ///
    /// Falls back to the host's port list and the well-known ports for the
    /// service when no fingerprint names it.
    pub fn open_service_port(&self, mac: &str, service: &str) -> Result<Option<u16>, DbError> {
        let mac = normalize_mac(mac);
        let service = service.trim().to_ascii_lowercase();
        if service.is_empty() {
            return Ok(None);
        }
        self.read(|conn| {
            let found: Option<u16> = conn
                .query_row(
                    "SELECT port FROM port_services \
                     WHERE mac_address = ?1 AND lower(service) = ?2 AND state = ?3 \
                     ORDER BY port LIMIT 1",
                    params![mac, service, PortState::Open.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            if found.is_some() {
                return Ok(found);
            }
            let Some(host) = get_host_in(conn, &mac)? else {
                return Ok(None);
            };
            Ok(well_known_ports(&service)
                .iter()
                .copied()
                .find(|p| host.has_port(*p)))
        })
    }

    pub fn has_open_service(&self, mac: &str, service: &str) -> Result<bool, DbError> {
        Ok(self.open_service_port(mac, service)?.is_some())
    }
}
