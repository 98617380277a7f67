//! Catalog trigger strings such as `on_service:ssh` or
//! `on_all:["on_host_alive","on_new_port:445"]`.

use std::collections::BTreeSet;
use std::str::FromStr;

use rustrecon_db::{DbError, Store};
use rustrecon_types::{Host, QueueStatus};

use crate::error::ConditionError;

/// Actions whose latest row records a host's presence state.
pub const PRESENCE_JOIN: &str = "PresenceJoin";
pub const PRESENCE_LEAVE: &str = "PresenceLeave";

/// When an action should be queued for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Never completed against this host yet (`on_start`, `on_new_host`).
    OnStart,
    HostAlive,
    HostDead,
    /// Host is alive and its last presence action was not a join.
    Join,
    /// Host is down and its last presence action was not a leave.
    Leave,
    PortChange,
    NewPort(u16),
    Service(String),
    WebService,
    Success(String),
    Failure(String),
    CredFound(String),
    MacIs(String),
    EssidIs(String),
    IpIs(String),
    HasCve(Option<String>),
    HasCpe(Option<String>),
    /// Periodic; published ahead of time instead of evaluated per host.
    Interval(u64),
    All(Vec<Trigger>),
    Any(Vec<Trigger>),
}

fn required(raw: &str, param: Option<&str>) -> Result<String, ConditionError> {
    match param {
        Some(p) if !p.is_empty() => Ok(p.to_string()),
        _ => Err(ConditionError::trigger(raw, "missing parameter")),
    }
}

fn parse_list(raw: &str, param: Option<&str>) -> Result<Vec<Trigger>, ConditionError> {
    let param = required(raw, param)?;
    let items: Vec<String> = serde_json::from_str(&param)
        .map_err(|e| ConditionError::trigger(raw, format!("expected a JSON list: {e}")))?;
    if items.is_empty() {
        return Err(ConditionError::trigger(raw, "empty trigger list"));
    }
    items.iter().map(|t| t.parse()).collect()
}

impl FromStr for Trigger {
    type Err = ConditionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        let (name, param) = match s.split_once(':') {
            Some((name, param)) => (name.trim(), Some(param.trim())),
            None => (s, None),
        };
        let optional = param.filter(|p| !p.is_empty()).map(str::to_string);

        Ok(match name {
            "on_start" | "on_new_host" => Trigger::OnStart,
            "on_host_alive" | "on_alive" => Trigger::HostAlive,
            "on_host_dead" | "on_dead" => Trigger::HostDead,
            "on_join" => Trigger::Join,
            "on_leave" => Trigger::Leave,
            "on_port_change" => Trigger::PortChange,
            "on_new_port" => {
                let port = required(raw, param)?;
                Trigger::NewPort(
                    port.parse()
                        .map_err(|_| ConditionError::trigger(raw, "port must be 0-65535"))?,
                )
            }
            "on_service" => Trigger::Service(required(raw, param)?.to_ascii_lowercase()),
            "on_web_service" => Trigger::WebService,
            "on_success" => Trigger::Success(required(raw, param)?),
            "on_failure" => Trigger::Failure(required(raw, param)?),
            "on_cred_found" => Trigger::CredFound(required(raw, param)?.to_ascii_lowercase()),
            "on_mac_is" => Trigger::MacIs(required(raw, param)?.to_ascii_lowercase()),
            "on_essid_is" => Trigger::EssidIs(required(raw, param)?),
            "on_ip_is" => Trigger::IpIs(required(raw, param)?),
            "on_has_cve" => Trigger::HasCve(optional),
            "on_has_cpe" => Trigger::HasCpe(optional),
            "on_interval" => {
                let secs = required(raw, param)?;
                match secs.parse::<u64>() {
                    Ok(secs) if secs > 0 => Trigger::Interval(secs),
                    _ => {
                        return Err(ConditionError::trigger(
                            raw,
                            "interval must be a positive number of seconds",
                        ));
                    }
                }
            }
            "on_all" => Trigger::All(parse_list(raw, param)?),
            "on_any" => Trigger::Any(parse_list(raw, param)?),
            "" => return Err(ConditionError::trigger(raw, "empty trigger")),
            other => {
                return Err(ConditionError::trigger(
                    raw,
                    format!("unknown trigger {other}"),
                ));
            }
        })
    }
}

/// Host and action a condition is evaluated for.
#[derive(Debug, Clone, Copy)]
pub struct EvalTarget<'a> {
    pub store: &'a Store,
    pub host: &'a Host,
    pub action: &'a str,
}

impl EvalTarget<'_> {
    pub(crate) fn mac(&self) -> &str {
        &self.host.mac_address
    }
}

fn last_presence(target: &EvalTarget<'_>) -> Result<Option<String>, DbError> {
    target
        .store
        .latest_action_among(target.mac(), &[PRESENCE_JOIN, PRESENCE_LEAVE])
}

impl Trigger {
    /// Interval in seconds, if this is a periodic trigger.
    pub fn interval(&self) -> Option<u64> {
        match self {
            Trigger::Interval(secs) => Some(*secs),
            _ => None,
        }
    }

    fn needs_alive_host(&self) -> bool {
        matches!(
            self,
            Trigger::PortChange | Trigger::NewPort(_) | Trigger::Service(_) | Trigger::WebService
        )
    }

    pub fn evaluate(&self, target: &EvalTarget<'_>) -> Result<bool, DbError> {
        let host = target.host;
        let mac = target.mac();
        if self.needs_alive_host() && !host.alive {
            return Ok(false);
        }
        Ok(match self {
            Trigger::OnStart => {
                !target
                    .store
                    .has_outcome(target.action, Some(mac), QueueStatus::Success)?
                    && !target
                        .store
                        .has_outcome(target.action, Some(mac), QueueStatus::Failed)?
            }
            Trigger::HostAlive => host.alive,
            Trigger::HostDead => !host.alive,
            Trigger::Join => {
                host.alive && last_presence(target)?.as_deref() != Some(PRESENCE_JOIN)
            }
            Trigger::Leave => {
                !host.alive && last_presence(target)?.as_deref() != Some(PRESENCE_LEAVE)
            }
            Trigger::PortChange => {
                let current: BTreeSet<u16> = host.ports.iter().copied().collect();
                let previous: BTreeSet<u16> = host.previous_ports.iter().copied().collect();
                current != previous
            }
            Trigger::NewPort(port) => host.has_port(*port) && !host.previous_ports.contains(port),
            Trigger::Service(service) => target.store.has_open_service(mac, service)?,
            Trigger::WebService => {
                target.store.has_open_service(mac, "http")?
                    || target.store.has_open_service(mac, "https")?
            }
            Trigger::Success(action) => {
                target
                    .store
                    .has_outcome(action, Some(mac), QueueStatus::Success)?
            }
            Trigger::Failure(action) => {
                target
                    .store
                    .has_outcome(action, Some(mac), QueueStatus::Failed)?
            }
            Trigger::CredFound(service) => target.store.has_cred(mac, Some(service))?,
            Trigger::MacIs(want) => mac.eq_ignore_ascii_case(want),
            Trigger::EssidIs(want) => host.essid.as_deref() == Some(want.as_str()),
            Trigger::IpIs(want) => host.ips.iter().any(|ip| ip == want),
            Trigger::HasCve(id) => target.store.has_active_vuln(mac, id.as_deref())?,
            Trigger::HasCpe(cpe) => target.store.has_active_software(mac, cpe.as_deref())?,
            Trigger::Interval(_) => false,
            Trigger::All(all) => {
                for trigger in all {
                    if !trigger.evaluate(target)? {
                        return Ok(false);
                    }
                }
                true
            }
            Trigger::Any(any) => {
                for trigger in any {
                    if trigger.evaluate(target)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrecon_types::{HostUpdate, NewCredential, NewQueueItem, PortServiceUpdate};

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn store_with_host(ports: &[u16]) -> (Store, Host) {
        let store = Store::open_in_memory().unwrap();
        store
            .update_host(MAC, &HostUpdate::default().ip("10.0.0.5").alive(true))
            .unwrap();
        store.update_ports_current(MAC, ports).unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        (store, host)
    }

    fn eval(trigger: &str, store: &Store, host: &Host) -> bool {
        let target = EvalTarget {
            store,
            host,
            action: "SSHBrute",
        };
        trigger.parse::<Trigger>().unwrap().evaluate(&target).unwrap()
    }

    #[test]
    fn parses_aliases_and_parameters() {
        assert_eq!("on_alive".parse::<Trigger>().unwrap(), Trigger::HostAlive);
        assert_eq!("on_new_host".parse::<Trigger>().unwrap(), Trigger::OnStart);
        assert_eq!(
            "on_service: SSH".parse::<Trigger>().unwrap(),
            Trigger::Service("ssh".into())
        );
        assert_eq!("on_has_cve".parse::<Trigger>().unwrap(), Trigger::HasCve(None));
        assert_eq!(
            "on_interval:600".parse::<Trigger>().unwrap().interval(),
            Some(600)
        );
        assert_eq!(
            r#"on_any:["on_service:http","on_new_port:8080"]"#
                .parse::<Trigger>()
                .unwrap(),
            Trigger::Any(vec![Trigger::Service("http".into()), Trigger::NewPort(8080)])
        );
    }

    #[test]
    fn rejects_malformed_triggers() {
        for raw in [
            "",
            "on_whatever",
            "on_new_port:http",
            "on_interval:0",
            "on_all:ssh",
            "on_service:",
        ] {
            assert!(raw.parse::<Trigger>().is_err(), "{raw} should not parse");
        }
    }

    fn record_presence(store: &Store, action: &str) {
        let id = store
            .enqueue_immediate(NewQueueItem::immediate(action, MAC, None))
            .unwrap();
        store.update_status(id, QueueStatus::Running, None, None).unwrap();
        store.update_status(id, QueueStatus::Success, None, None).unwrap();
    }

    #[test]
    fn join_and_leave_follow_presence_history() {
        assert_eq!("on_join".parse::<Trigger>().unwrap(), Trigger::Join);
        assert_eq!(" on_leave ".parse::<Trigger>().unwrap(), Trigger::Leave);

        let (store, host) = store_with_host(&[22]);
        assert!(eval("on_join", &store, &host));
        assert!(!eval("on_leave", &store, &host));

        record_presence(&store, PRESENCE_JOIN);
        assert!(!eval("on_join", &store, &host));

        store.set_alive(MAC, false).unwrap();
        let gone = store.get_host(MAC).unwrap().unwrap();
        assert!(eval("on_leave", &store, &gone));
        assert!(!eval("on_join", &store, &gone));

        record_presence(&store, PRESENCE_LEAVE);
        assert!(!eval("on_leave", &store, &gone));
        assert!(eval("on_join", &store, &host));
    }

    #[test]
    fn port_and_service_triggers() {
        let (store, host) = store_with_host(&[22, 80]);
        assert!(eval("on_new_port:22", &store, &host));
        assert!(!eval("on_new_port:443", &store, &host));
        assert!(eval("on_port_change", &store, &host));
        assert!(eval("on_service:ssh", &store, &host));
        assert!(eval("on_web_service", &store, &host));
        assert!(!eval("on_service:smb", &store, &host));

        store.update_ports_current(MAC, &[80]).unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        assert!(!eval("on_new_port:22", &store, &host));
        assert!(!eval("on_service:ssh", &store, &host));
    }

    #[test]
    fn dead_hosts_skip_port_triggers() {
        let (store, _) = store_with_host(&[22]);
        store.set_alive(MAC, false).unwrap();
        let host = store.get_host(MAC).unwrap().unwrap();
        assert!(!eval("on_service:ssh", &store, &host));
        assert!(!eval("on_new_port:22", &store, &host));
        assert!(eval("on_host_dead", &store, &host));
        assert!(!eval("on_host_alive", &store, &host));
    }

    #[test]
    fn queue_history_triggers() {
        let (store, host) = store_with_host(&[22]);
        assert!(eval("on_start", &store, &host));
        assert!(!eval("on_success:PortScan", &store, &host));

        let id = store
            .enqueue_immediate(NewQueueItem::immediate("PortScan", MAC, None))
            .unwrap();
        store.update_status(id, QueueStatus::Running, None, None).unwrap();
        store.update_status(id, QueueStatus::Success, None, None).unwrap();
        assert!(eval("on_success:PortScan", &store, &host));
        assert!(!eval("on_failure:PortScan", &store, &host));

        let id = store
            .enqueue_immediate(NewQueueItem::immediate("SSHBrute", MAC, None))
            .unwrap();
        store.update_status(id, QueueStatus::Running, None, None).unwrap();
        store.update_status(id, QueueStatus::Failed, Some("refused"), None).unwrap();
        assert!(!eval("on_start", &store, &host));
    }

    #[test]
    fn finding_and_identity_triggers() {
        let (store, host) = store_with_host(&[22]);
        assert!(!eval("on_has_cve", &store, &host));
        store.add_vulnerability(MAC, "CVE-2023-38408", None, None, Some(22)).unwrap();
        assert!(eval("on_has_cve", &store, &host));
        assert!(eval("on_has_cve:CVE-2023-38408", &store, &host));
        assert!(!eval("on_has_cve:CVE-2021-0001", &store, &host));

        store
            .upsert_port_service(
                MAC,
                22,
                &PortServiceUpdate::open("ssh").product("OpenSSH", Some("8.9")),
            )
            .unwrap();
        store
            .add_detected_software(MAC, "cpe:/a:openbsd:openssh:8.9", None, None, Some(22))
            .unwrap();
        assert!(eval("on_has_cpe:cpe:/a:openbsd:openssh", &store, &host));

        store
            .insert_cred(&NewCredential::new("ssh", MAC).login("pi", "raspberry"))
            .unwrap();
        assert!(eval("on_cred_found:SSH", &store, &host));
        assert!(!eval("on_cred_found:ftp", &store, &host));

        assert!(eval("on_mac_is:AA:BB:CC:DD:EE:FF", &store, &host));
        assert!(eval("on_ip_is:10.0.0.5", &store, &host));
        assert!(!eval("on_essid_is:corp", &store, &host));
        assert!(eval(r#"on_all:["on_host_alive","on_ip_is:10.0.0.5"]"#, &store, &host));
        assert!(!eval(r#"on_all:["on_host_alive","on_ip_is:10.0.0.6"]"#, &store, &host));
    }
}
