//! nodeflow configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (NODEFLOW_*)
//! 3. Config file (explicit path, or ~/.config/nodeflow/config.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use nodeflow::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default().with_env();
//! let scheduler = config.scheduler_config();
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{ClusterConfig, TransportLimits};
use crate::runtime::scheduler::{ExecutionMode, SchedulerConfig, DEFAULT_STACK_SIZE};
use crate::util::logger::LogLevel;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "NODEFLOW_";

/// Full runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[cluster]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSection {
    /// Nodes of an in-process cluster
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Registered segment size per node in bytes
    #[serde(default = "default_segment_len")]
    pub segment_len: usize,
    #[serde(default = "default_payload")]
    pub max_medium: usize,
    #[serde(default = "default_payload")]
    pub max_long_request: usize,
    #[serde(default = "default_payload")]
    pub max_long_reply: usize,
    /// Hostname the master announces
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

fn default_nodes() -> usize {
    2
}

fn default_segment_len() -> usize {
    1024 * 1024
}

fn default_payload() -> usize {
    64 * 1024
}

fn default_hostname() -> String {
    "localhost".to_string()
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            segment_len: default_segment_len(),
            max_medium: default_payload(),
            max_long_request: default_payload(),
            max_long_reply: default_payload(),
            hostname: default_hostname(),
        }
    }
}

/// Task execution mode as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeSetting {
    Inline,
    #[default]
    Stackful,
}

/// Scheduling policy as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicySetting {
    Fifo,
    #[default]
    WorkStealing,
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSection {
    /// Worker threads per node; all cores when unset
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    #[serde(default = "default_wait_spins")]
    pub wait_spins: u32,
    #[serde(default)]
    pub mode: ModeSetting,
    #[serde(default)]
    pub policy: PolicySetting,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub stats: bool,
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_wait_spins() -> u32 {
    100
}

fn default_idle_timeout_ms() -> u64 {
    1
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: None,
            stack_size: default_stack_size(),
            wait_spins: default_wait_spins(),
            mode: ModeSetting::default(),
            policy: PolicySetting::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            stats: false,
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LogSection {
    #[serde(default)]
    pub level: LogLevel,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("Cannot determine config directory")]
    NoConfigDir,
}

impl RuntimeConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, else the user config file, else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match get_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write to `path`, creating its directory.
    pub fn save(
        &self,
        path: &Path,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        let content = self.to_toml_string()?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `NODEFLOW_*` variables from the process environment.
    ///
    /// Malformed values are logged and skipped.
    pub fn with_env(mut self) -> Self {
        if let Err(err) = self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok()) {
            tracing::warn!("ignoring environment override: {}", err);
        }
        self
    }

    /// Apply overrides looked up by key without prefix (`NODES`, `WORKERS`, ...).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("NODES") {
            self.cluster.nodes = parse_number("NODES", &value)?;
        }
        if let Some(value) = lookup("SEGMENT_LEN") {
            self.cluster.segment_len = parse_number("SEGMENT_LEN", &value)?;
        }
        if let Some(value) = lookup("MAX_MEDIUM") {
            self.cluster.max_medium = parse_number("MAX_MEDIUM", &value)?;
        }
        if let Some(value) = lookup("HOSTNAME") {
            self.cluster.hostname = value;
        }
        if let Some(value) = lookup("WORKERS") {
            self.scheduler.workers = Some(parse_number("WORKERS", &value)?);
        }
        if let Some(value) = lookup("MODE") {
            self.scheduler.mode = match value.trim() {
                "inline" => ModeSetting::Inline,
                "stackful" => ModeSetting::Stackful,
                _ => return Err(invalid("MODE", &value)),
            };
        }
        if let Some(value) = lookup("POLICY") {
            self.scheduler.policy = match value.trim() {
                "fifo" => PolicySetting::Fifo,
                "work-stealing" => PolicySetting::WorkStealing,
                _ => return Err(invalid("POLICY", &value)),
            };
        }
        if let Some(value) = lookup("LOG") {
            self.log.level = value.parse().map_err(|_| invalid("LOG", &value))?;
        }
        Ok(())
    }

    /// Scheduler settings of every node.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let section = &self.scheduler;
        let num_workers = section.workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        SchedulerConfig {
            num_workers: num_workers.max(1),
            default_stack_size: section.stack_size,
            wait_spins: section.wait_spins,
            use_work_stealing: section.policy == PolicySetting::WorkStealing,
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
            mode: match section.mode {
                ModeSetting::Inline => ExecutionMode::Inline,
                ModeSetting::Stackful => ExecutionMode::Stackful,
            },
            enable_stats: section.stats,
        }
    }

    /// Settings of an in-process cluster.
    pub fn cluster_config(&self) -> ClusterConfig {
        let section = &self.cluster;
        ClusterConfig {
            nodes: section.nodes.max(1),
            segment_len: section.segment_len,
            limits: TransportLimits {
                max_medium: section.max_medium,
                max_long_request: section.max_long_request,
                max_long_reply: section.max_long_reply,
            },
            hostname: section.hostname.clone(),
            ..ClusterConfig::default()
        }
    }
}

fn invalid(
    key: &str,
    value: &str,
) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("nodeflow"));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("nodeflow"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("nodeflow"));
    }

    None
}

/// Get the user config file path (~/.config/nodeflow/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

#[cfg(test)]
mod tests;
