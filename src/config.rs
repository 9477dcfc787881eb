//! Daemon configuration.
//!
//! Loaded from a JSON file (`--config`) or from inline JSON in the
//! `CODE_SANDBOX_CONFIG` environment variable. Every field has a default, so an
//! empty object (or no configuration at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV_VAR: &str = "CODE_SANDBOX_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Execution limits.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Per-project environment provisioning.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Variables handed to executed code.
    #[serde(default)]
    pub restricted_env: RestrictedEnvConfig,

    /// Default project (optional).
    #[serde(default)]
    pub project: Option<ProjectConfig>,
}

/// Limits applied to every execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout used when a request does not specify one.
    #[serde(default = "default_timeout")]
    pub default_timeout_seconds: u64,

    /// Largest timeout a request may ask for.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_seconds: u64,

    /// Byte budget for each of stdout and stderr.
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Shell used for `shell` requests.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout(),
            max_timeout_seconds: default_max_timeout(),
            max_output_bytes: default_max_output(),
            shell: default_shell(),
        }
    }
}

/// How per-project environments are laid out and provisioned.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// Interpreter used to create new environments (`<it> -m venv <dir>`).
    #[serde(default = "default_base_interpreter")]
    pub base_interpreter: String,

    /// Reserved directory name inside each project.
    #[serde(default = "default_env_dir")]
    pub dir_name: String,

    /// Sidecar metadata file name inside the environment directory.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,

    #[serde(default = "default_create_timeout")]
    pub create_timeout_seconds: u64,

    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout_seconds: u64,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_seconds: u64,

    /// Upgrade the package manager after creating an environment.
    #[serde(default = "default_true")]
    pub upgrade_package_manager: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_interpreter: default_base_interpreter(),
            dir_name: default_env_dir(),
            metadata_file: default_metadata_file(),
            create_timeout_seconds: default_create_timeout(),
            upgrade_timeout_seconds: default_upgrade_timeout(),
            install_timeout_seconds: default_install_timeout(),
            upgrade_package_manager: true,
        }
    }
}

impl EnvironmentConfig {
    pub const fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_seconds)
    }

    pub const fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_seconds)
    }

    pub const fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_seconds)
    }
}

/// Fixed values for the child process environment.
#[derive(Debug, Clone, Deserialize)]
pub struct RestrictedEnvConfig {
    /// `PATH` seen by executed code.
    #[serde(default = "default_path")]
    pub path: String,

    /// Value for `LANG` and `LC_ALL`.
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for RestrictedEnvConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            locale: default_locale(),
        }
    }
}

/// Default project directory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Path to the project directory.
    #[serde(default = "default_project_path")]
    pub path: PathBuf,
}

fn default_project_path() -> PathBuf {
    ".".into()
}

impl Config {
    /// Load configuration from `CODE_SANDBOX_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(json) => {
                serde_json::from_str(&json).with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))
            }
            Err(_) => {
                debug!("{CONFIG_ENV_VAR} not set, using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Resolve the default project directory to an absolute path.
    ///
    /// Priority: `PROJECT_DIR` env var > `[project]` config.
    pub fn resolved_project_dir(&self) -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("PROJECT_DIR") {
            let path = PathBuf::from(&dir);
            if path.is_dir() {
                return Some(path);
            }
        }
        self.project.as_ref().map(|p| {
            if p.path.is_absolute() {
                p.path.clone()
            } else {
                std::env::current_dir().unwrap_or_default().join(&p.path)
            }
        })
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

const fn default_timeout() -> u64 {
    30
}

const fn default_max_timeout() -> u64 {
    300
}

const fn default_max_output() -> usize {
    100_000
}

fn default_shell() -> String {
    "bash".into()
}

fn default_base_interpreter() -> String {
    "python3".into()
}

fn default_env_dir() -> String {
    ".venv".into()
}

fn default_metadata_file() -> String {
    "sandbox.json".into()
}

const fn default_create_timeout() -> u64 {
    60
}

const fn default_upgrade_timeout() -> u64 {
    120
}

const fn default_install_timeout() -> u64 {
    300
}

const fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/usr/bin:/bin:/usr/local/bin".into()
}

fn default_locale() -> String {
    "C.UTF-8".into()
}
