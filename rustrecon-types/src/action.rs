use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::service::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(ParseEnumError::new("risk level", s)),
        }
    }
}

/// Whether an action runs per host or once against the controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionScope {
    #[default]
    Normal,
    Global,
}

impl fmt::Display for ActionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionScope::Normal => write!(f, "normal"),
            ActionScope::Global => write!(f, "global"),
        }
    }
}

impl FromStr for ActionScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(ActionScope::Normal),
            "global" => Ok(ActionScope::Global),
            _ => Err(ParseEnumError::new("action scope", s)),
        }
    }
}

fn default_priority() -> i32 {
    crate::queue::DEFAULT_PRIORITY
}

fn default_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    crate::queue::DEFAULT_MAX_RETRIES
}

fn default_stealth() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

/// Catalog entry describing a runnable action.
///
/// Deserializes from the `[[action]]` tables of a catalog TOML file; every
/// field except `name` has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub requires: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub cooldown_secs: u64,
    /// `"N/SECONDS"`: at most N enqueues per window.
    #[serde(default)]
    pub rate_limit: Option<String>,
    #[serde(default = "default_stealth")]
    pub stealth_level: u8,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: ActionScope,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ActionDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            module: None,
            port: None,
            services: Vec::new(),
            trigger: None,
            requires: None,
            priority: default_priority(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            cooldown_secs: 0,
            rate_limit: None,
            stealth_level: default_stealth(),
            risk_level: RiskLevel::default(),
            enabled: true,
            scope: ActionScope::default(),
            tags: Vec::new(),
            args: None,
            description: None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.scope == ActionScope::Global
    }

    /// Parse `rate_limit` into `(count, window_secs)`.
    pub fn parsed_rate_limit(&self) -> Option<(u64, u64)> {
        let raw = self.rate_limit.as_deref()?;
        let (count, window) = raw.split_once('/')?;
        let count = count.trim().parse().ok()?;
        let window = window.trim().parse().ok()?;
        if count == 0 || window == 0 {
            return None;
        }
        Some((count, window))
    }
}

/// Catalog file layout: a list of `[[action]]` tables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionCatalog {
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionDefinition>,
}
