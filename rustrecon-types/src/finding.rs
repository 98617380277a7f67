use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of comparing a stored finding set against a fresh scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    New,
    Seen,
    Inactive,
}

impl PresenceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceEvent::New => "new",
            PresenceEvent::Seen => "seen",
            PresenceEvent::Inactive => "inactive",
        }
    }
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vulnerability identifier tracked on `(mac, vuln_id, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: i64,
    pub mac_address: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    /// `0` when the finding is host-wide.
    pub port: u16,
    pub vuln_id: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_active: bool,
}

/// A CPE tracked on `(mac, cpe, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedSoftware {
    pub id: i64,
    pub mac_address: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    pub cpe: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_active: bool,
}

/// One entry of a presence history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub mac_address: String,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    /// Vulnerability id or CPE.
    pub item: String,
    pub event: PresenceEvent,
    pub seen_at: i64,
}

/// A raw scanner finding before it is routed to vulnerabilities or software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Finding {
    pub fn new(id: &str, port: Option<u16>) -> Self {
        Self {
            id: id.trim().to_string(),
            port,
        }
    }

    pub fn kind(&self) -> FindingKind {
        let lowered = self.id.to_ascii_lowercase();
        if lowered.starts_with("cpe:") {
            FindingKind::Cpe
        } else if lowered.starts_with("cve-") {
            FindingKind::Cve
        } else {
            FindingKind::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Cve,
    Cpe,
    Other,
}

/// Counts returned after persisting a batch of findings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub vulnerabilities: usize,
    pub software: usize,
    pub ports: usize,
}

/// A recovered credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub service: String,
    pub mac_address: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Insert request for a credential.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCredential {
    pub service: String,
    pub mac_address: Option<String>,
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub extra: Option<serde_json::Value>,
}

impl NewCredential {
    pub fn new(service: &str, mac_address: &str) -> Self {
        Self {
            service: service.to_string(),
            mac_address: Some(mac_address.to_string()),
            ..Self::default()
        }
    }

    pub fn login(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_kind_is_case_insensitive() {
        assert_eq!(Finding::new("CVE-2021-44228", None).kind(), FindingKind::Cve);
        assert_eq!(
            Finding::new("cpe:/a:apache:http_server:2.4.49", Some(80)).kind(),
            FindingKind::Cpe
        );
        assert_eq!(Finding::new("weak-cipher", Some(443)).kind(), FindingKind::Other);
    }
}
