use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The state of a port, following nmap conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unfiltered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "closed|filtered")]
    ClosedFiltered,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
            PortState::Unfiltered => write!(f, "unfiltered"),
            PortState::OpenFiltered => write!(f, "open|filtered"),
            PortState::ClosedFiltered => write!(f, "closed|filtered"),
        }
    }
}

impl FromStr for PortState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "unfiltered" => Ok(PortState::Unfiltered),
            "open|filtered" => Ok(PortState::OpenFiltered),
            "closed|filtered" => Ok(PortState::ClosedFiltered),
            _ => Err(ParseEnumError::new("port state", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            _ => Err(ParseEnumError::new("protocol", s)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Current fingerprint of one `(mac, port, protocol)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortService {
    pub mac_address: String,
    pub ip: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub fingerprint: Option<String>,
    pub confidence: Option<f64>,
    pub source: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_current: bool,
}

/// Freshly observed facts for one port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortServiceUpdate {
    pub ip: Option<String>,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub fingerprint: Option<String>,
    pub confidence: Option<f64>,
    pub source: String,
}

impl Default for PortServiceUpdate {
    fn default() -> Self {
        Self {
            ip: None,
            protocol: Protocol::Tcp,
            state: PortState::Open,
            service: None,
            product: None,
            version: None,
            banner: None,
            fingerprint: None,
            confidence: None,
            source: "scan".to_string(),
        }
    }
}

impl PortServiceUpdate {
    pub fn open(service: &str) -> Self {
        Self {
            service: Some(service.to_string()),
            ..Self::default()
        }
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn state(mut self, state: PortState) -> Self {
        self.state = state;
        self
    }

    pub fn product(mut self, product: &str, version: Option<&str>) -> Self {
        self.product = Some(product.to_string());
        self.version = version.map(str::to_string);
        self
    }
}

/// Snapshot written to the service history log when a port's fingerprint changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortServiceChange {
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub seen_at: i64,
}

/// Well-known ports tried when no fingerprint row names a service.
pub fn well_known_ports(service: &str) -> &'static [u16] {
    match service.trim().to_ascii_lowercase().as_str() {
        "ftp" => &[21],
        "ssh" => &[22],
        "telnet" => &[23],
        "smtp" => &[25, 587],
        "dns" => &[53],
        "http" => &[80, 8080, 8000],
        "https" => &[443, 8443],
        "smb" | "microsoft-ds" => &[445],
        "netbios-ssn" => &[139],
        "mysql" => &[3306],
        "rdp" | "ms-wbt-server" => &[3389],
        "postgresql" => &[5432],
        "vnc" => &[5900],
        "redis" => &[6379],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_state_parses_nmap_forms() {
        assert_eq!("open|filtered".parse::<PortState>().unwrap(), PortState::OpenFiltered);
        assert_eq!("OPEN".parse::<PortState>().unwrap(), PortState::Open);
        assert!("ajar".parse::<PortState>().is_err());
    }

    #[test]
    fn protocol_display_matches_parse() {
        for p in [Protocol::Tcp, Protocol::Udp, Protocol::Sctp] {
            assert_eq!(p.to_string().parse::<Protocol>().unwrap(), p);
        }
    }

    #[test]
    fn well_known_ports_lookup() {
        assert_eq!(well_known_ports("SSH"), &[22]);
        assert!(well_known_ports("gopher").is_empty());
    }
}
