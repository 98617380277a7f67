//! Preconditions attached to catalog actions.
//!
//! Written as JSON (`{"all": [{"action": "PortScan", "status": "success"}, {"has_port": 22}]}`)
//! or in the short `"PortScan:success"` form.

use rustrecon_db::DbError;
use rustrecon_types::QueueStatus;
use serde_json::{Map, Value};

use crate::error::ConditionError;
use crate::trigger::EvalTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    All(Vec<Requirement>),
    Any(Vec<Requirement>),
    Not(Box<Requirement>),
    /// Some row of `action` reached `status`, on this host or (`global`) anywhere.
    ActionStatus {
        action: String,
        status: QueueStatus,
        global: bool,
    },
    HasPort(u16),
    HasCred(String),
    HasCve(String),
    HasCpe(String),
    MacIs(String),
    EssidIs(String),
    ServiceIsOpen(String),
}

fn text(raw: &str, value: &Value) -> Result<String, ConditionError> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(ConditionError::requirement(raw, "expected a string")),
    };
    if s.is_empty() {
        return Err(ConditionError::requirement(raw, "empty value"));
    }
    Ok(s)
}

fn status(raw: &str, value: Option<&Value>) -> Result<QueueStatus, ConditionError> {
    match value {
        None | Some(Value::Null) => Ok(QueueStatus::Success),
        Some(v) => text(raw, v)?
            .parse()
            .map_err(|e| ConditionError::requirement(raw, format!("{e}"))),
    }
}

fn from_object(raw: &str, obj: &Map<String, Value>) -> Result<Requirement, ConditionError> {
    let list = |v: &Value| -> Result<Vec<Requirement>, ConditionError> {
        match v {
            Value::Array(items) => items.iter().map(|i| from_value(raw, i)).collect(),
            _ => Err(ConditionError::requirement(raw, "expected a list")),
        }
    };

    if let Some(v) = obj.get("all") {
        return Ok(Requirement::All(list(v)?));
    }
    if let Some(v) = obj.get("any") {
        return Ok(Requirement::Any(list(v)?));
    }
    if let Some(v) = obj.get("not") {
        return Ok(Requirement::Not(Box::new(from_value(raw, v)?)));
    }
    if let Some(v) = obj.get("action") {
        let global = match obj.get("scope") {
            None | Some(Value::Null) => false,
            Some(scope) => match text(raw, scope)?.to_ascii_lowercase().as_str() {
                "host" => false,
                "global" => true,
                other => {
                    return Err(ConditionError::requirement(
                        raw,
                        format!("unknown scope {other}"),
                    ));
                }
            },
        };
        return Ok(Requirement::ActionStatus {
            action: text(raw, v)?,
            status: status(raw, obj.get("status"))?,
            global,
        });
    }
    if let Some(v) = obj.get("has_port") {
        let port = text(raw, v)?
            .parse()
            .map_err(|_| ConditionError::requirement(raw, "port must be 0-65535"))?;
        return Ok(Requirement::HasPort(port));
    }
    if let Some(v) = obj.get("has_cred") {
        return Ok(Requirement::HasCred(text(raw, v)?.to_ascii_lowercase()));
    }
    if let Some(v) = obj.get("has_cve") {
        return Ok(Requirement::HasCve(text(raw, v)?));
    }
    if let Some(v) = obj.get("has_cpe") {
        return Ok(Requirement::HasCpe(text(raw, v)?));
    }
    if let Some(v) = obj.get("mac_is") {
        return Ok(Requirement::MacIs(text(raw, v)?.to_ascii_lowercase()));
    }
    if let Some(v) = obj.get("essid_is") {
        return Ok(Requirement::EssidIs(text(raw, v)?));
    }
    if let Some(v) = obj.get("service_is_open") {
        return Ok(Requirement::ServiceIsOpen(text(raw, v)?.to_ascii_lowercase()));
    }
    Err(ConditionError::requirement(raw, "no recognized key"))
}

fn from_value(raw: &str, value: &Value) -> Result<Requirement, ConditionError> {
    match value {
        Value::Object(obj) => from_object(raw, obj),
        // A bare list means every entry must hold.
        Value::Array(items) => Ok(Requirement::All(
            items
                .iter()
                .map(|i| from_value(raw, i))
                .collect::<Result<_, _>>()?,
        )),
        Value::String(s) => parse_short(raw, s),
        _ => Err(ConditionError::requirement(raw, "expected an object")),
    }
}

fn parse_short(raw: &str, s: &str) -> Result<Requirement, ConditionError> {
    let Some((action, status)) = s.split_once(':') else {
        return Err(ConditionError::requirement(raw, "expected Action:status"));
    };
    let action = action.trim();
    if action.is_empty() {
        return Err(ConditionError::requirement(raw, "missing action name"));
    }
    let status = status
        .trim()
        .parse()
        .map_err(|e| ConditionError::requirement(raw, format!("{e}")))?;
    Ok(Requirement::ActionStatus {
        action: action.to_string(),
        status,
        global: false,
    })
}

impl Requirement {
    /// Parse a catalog `requires` field. Blank means no requirement.
    pub fn parse(raw: &str) -> Result<Option<Requirement>, ConditionError> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(None);
        }
        if s.starts_with('{') || s.starts_with('[') {
            let value: Value = serde_json::from_str(s)
                .map_err(|e| ConditionError::requirement(raw, format!("bad JSON: {e}")))?;
            return from_value(raw, &value).map(Some);
        }
        parse_short(raw, s).map(Some)
    }

    pub fn evaluate(&self, target: &EvalTarget<'_>) -> Result<bool, DbError> {
        let store = target.store;
        let mac = target.mac();
        Ok(match self {
            Requirement::All(all) => {
                for req in all {
                    if !req.evaluate(target)? {
                        return Ok(false);
                    }
                }
                true
            }
            Requirement::Any(any) => {
                for req in any {
                    if req.evaluate(target)? {
                        return Ok(true);
                    }
                }
                false
            }
            Requirement::Not(inner) => !inner.evaluate(target)?,
            Requirement::ActionStatus {
                action,
                status,
                global,
            } => {
                let scope = if *global { None } else { Some(mac) };
                store.has_outcome(action, scope, *status)?
            }
            Requirement::HasPort(port) => target.host.has_port(*port),
            Requirement::HasCred(service) => store.has_cred(mac, Some(service))?,
            Requirement::HasCve(id) => store.has_active_vuln(mac, Some(id))?,
            Requirement::HasCpe(cpe) => store.has_active_software(mac, Some(cpe))?,
            Requirement::MacIs(want) => mac.eq_ignore_ascii_case(want),
            Requirement::EssidIs(want) => target.host.essid.as_deref() == Some(want.as_str()),
            Requirement::ServiceIsOpen(service) => store.has_open_service(mac, service)?,
        })
    }
}
