//! jobrunner configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ipc;

/// Main jobrunner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// YAML files holding job definitions
    #[serde(rename = "jobs-files")]
    pub jobs_files: Vec<PathBuf>,

    /// Root of lock files, run directories and the last-run database
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Control socket path
    #[serde(rename = "socket-path")]
    pub socket_path: PathBuf,

    /// Engine tuning
    pub runner: RunnerConfig,

    /// Health report output
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobrunner");
        Self {
            log_level: None,
            jobs_files: vec![config_dir.join("jobs.yml")],
            state_dir: default_state_dir(),
            socket_path: ipc::default_socket_path(),
            runner: RunnerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    // ~/.local/share/jobrunner on Linux
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".jobrunner"))
        .join("jobrunner")
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .jobrunner.yml
        let local_config = PathBuf::from(".jobrunner.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/jobrunner/jobrunner.yml
        if let Some(user_config) = Self::user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up
    ///
    /// Follows the same lookup order as [`Config::load`] and ignores every
    /// error, since nothing can be reported yet.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(PathBuf::from(".jobrunner.yml"))
                .chain(Self::user_config_path())
                .collect(),
        };
        candidates
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("jobrunner").join("jobrunner.yml"))
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.resolve_relative_to(path.as_ref().parent());

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Relative job files are taken relative to the config file
    fn resolve_relative_to(&mut self, base: Option<&Path>) {
        let Some(base) = base.filter(|b| !b.as_os_str().is_empty()) else {
            return;
        };
        for file in &mut self.jobs_files {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }

    /// Last-run database location
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("jobrunner.db")
    }

    /// Master lock held by the running daemon
    pub fn master_lock_path(&self) -> PathBuf {
        self.state_dir.join("job-runner-master.lock")
    }

    /// Health report location, defaulting under the state directory
    pub fn report_path(&self) -> PathBuf {
        self.health
            .report_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("health.json"))
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum jobs with `wait: true` running at once
    #[serde(rename = "max-parallel-jobs")]
    pub max_parallel_jobs: usize,

    /// Longest sleep between cycles
    #[serde(rename = "max-sleep-secs")]
    pub max_sleep_secs: u64,

    /// Interval between warnings while paused
    #[serde(rename = "pause-warn-secs")]
    pub pause_warn_secs: u64,

    /// Wait between SIGTERM and SIGKILL
    #[serde(rename = "kill-grace-secs")]
    pub kill_grace_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 3,
            max_sleep_secs: 300,
            pause_warn_secs: 3600,
            kill_grace_secs: 5,
        }
    }
}

/// Health report output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,

    /// Defaults to `health.json` under the state directory
    #[serde(rename = "report-path", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,

    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_path: None,
            interval_secs: 60,
        }
    }
}
