use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::ErrorPolicy;
use crate::flow::ScriptLimits;
use crate::{flog_debug, Error, Result};

/// Engine settings read from `~/.flowsched/flowsched.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on task instances a single job may materialise.
    pub max_instances: usize,
    /// Number of instances dispatched to executors at the same time.
    pub max_workers: usize,
    /// Wall-clock budget for one flow script evaluation.
    pub script_timeout_ms: u64,
    /// Operation budget for one flow script evaluation.
    pub script_max_operations: u64,
    /// Error policy for tasks that do not declare their own.
    pub default_error_policy: ErrorPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_instances: 10_000,
            max_workers: 8,
            script_timeout_ms: 1_000,
            script_max_operations: 100_000,
            default_error_policy: ErrorPolicy::CancelJob,
        }
    }
}

impl Config {
    pub fn flowsched_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".flowsched"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::flowsched_dir()?.join("flowsched.toml"))
    }

    /// Load the user config, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        flog_debug!(
            "Config loaded: max_instances={}, max_workers={}, policy={}",
            config.max_instances,
            config.max_workers,
            config.default_error_policy
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            timeout: Duration::from_millis(self.script_timeout_ms),
            max_operations: self.script_max_operations,
            ..ScriptLimits::default()
        }
    }
}
