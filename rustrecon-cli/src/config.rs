use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rustrecon_core::OrchestratorConfig;
use rustrecon_db::{StoreConfig, default_db_path};
use serde::{Deserialize, Serialize};

use crate::args::RunArgs;

/// Settings file layout.
///
/// ```toml
/// db_path = "/var/lib/rustrecon/rustrecon.db"
///
/// [store]
/// busy_timeout_ms = 5000
///
/// [orchestrator]
/// workers = 4
/// controller_mac = "aa:bb:cc:dd:ee:ff"
/// ```
///
/// Every field is optional. Precedence is flags, then this file, then defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
}

/// `config.toml` next to the default database.
pub fn default_config_path() -> PathBuf {
    default_db_path().with_file_name("config.toml")
}

/// Load the settings file. A missing file is an error only when the path was
/// given explicitly.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                return Ok(FileConfig::default());
            }
            path
        }
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    parse(&content).with_context(|| format!("failed to parse config '{}'", path.display()))
}

pub fn parse(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

impl FileConfig {
    /// Database path: `--db`, else the file's `db_path`, else the default.
    pub fn db_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.db_path.clone())
            .unwrap_or_else(default_db_path)
    }

    /// Apply `run` flags that were given on the command line.
    pub fn apply_run_flags(&mut self, run: &RunArgs) {
        if let Some(workers) = run.workers {
            self.orchestrator.workers = usize::from(workers);
        }
        if let Some(mac) = &run.controller_mac {
            self.orchestrator.controller_mac = Some(mac.clone());
        }
        if let Some(tick) = run.tick_secs {
            self.orchestrator.tick_interval_secs = tick;
        }
    }
}
