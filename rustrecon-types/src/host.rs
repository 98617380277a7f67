use serde::{Deserialize, Serialize};

/// Prefix of transitional identities keyed by IP instead of MAC.
pub const STUB_MAC_PREFIX: &str = "ip:";

/// Canonical form of a MAC address key: trimmed and lowercase.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

/// An IP-only placeholder identity such as `ip:10.0.0.5`.
pub fn is_stub_mac(mac: &str) -> bool {
    mac.trim().to_ascii_lowercase().starts_with(STUB_MAC_PREFIX)
}

/// Stub identity for an address with no known MAC.
pub fn stub_mac_for(ip: &str) -> String {
    format!("{STUB_MAC_PREFIX}{}", ip.trim())
}

/// A network endpoint, keyed by MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Host {
    pub mac_address: String,
    pub ips: Vec<String>,
    pub previous_ips: Vec<String>,
    pub hostnames: Vec<String>,
    pub previous_hostnames: Vec<String>,
    pub ports: Vec<u16>,
    pub previous_ports: Vec<u16>,
    pub vendor: Option<String>,
    pub essid: Option<String>,
    pub previous_essids: Vec<String>,
    pub alive: bool,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
}

impl Host {
    pub fn primary_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str)
    }

    pub fn primary_hostname(&self) -> Option<&str> {
        self.hostnames.first().map(String::as_str)
    }

    pub fn is_stub(&self) -> bool {
        is_stub_mac(&self.mac_address)
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Partial host update. `None` and empty collections leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostUpdate {
    pub ips: Option<Vec<String>>,
    pub hostnames: Option<Vec<String>>,
    pub ports: Option<Vec<u16>>,
    pub vendor: Option<String>,
    pub essid: Option<String>,
    pub alive: Option<bool>,
}

impl HostUpdate {
    pub fn ip(mut self, ip: &str) -> Self {
        self.ips = Some(vec![ip.to_string()]);
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostnames = Some(vec![hostname.to_string()]);
        self
    }

    pub fn vendor(mut self, vendor: &str) -> Self {
        self.vendor = Some(vendor.to_string());
        self
    }

    pub fn alive(mut self, alive: bool) -> Self {
        self.alive = Some(alive);
        self
    }
}

/// One hostname observed for a MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameRecord {
    pub hostname: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_current: bool,
}
