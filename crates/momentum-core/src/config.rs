//! `momentum.toml` configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mode::{ExecutionMode, LifecycleMode};

pub const DEFAULT_CONFIG_FILE: &str = "momentum.toml";
pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MomentumConfig {
    pub board: BoardConfig,
    pub agent: AgentConfig,
    pub scheduler: SchedulerSettings,
    pub feed: FeedSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub base_url: String,
    /// Timeout for plain REST calls. The change feed itself never times out.
    pub request_timeout_secs: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Registry name of the agent driver.
    pub name: String,
    pub executable: String,
    /// Fixed arguments placed before the prompt.
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// 0 disables the per-run deadline.
    pub timeout_secs: u64,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            executable: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            work_dir: None,
            timeout_secs: 0,
            env: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub execution_mode: ExecutionMode,
    pub lifecycle: LifecycleMode,
    /// Replaces the default prompt preamble when set.
    pub instructions: Option<String>,
    pub idle_poll_secs: u64,
    pub error_retry_secs: u64,
    pub queue_pause_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Async,
            lifecycle: LifecycleMode::Orchestrator,
            instructions: None,
            idle_poll_secs: 5,
            error_retry_secs: 5,
            queue_pause_ms: 250,
        }
    }
}

impl SchedulerSettings {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_secs(self.error_retry_secs)
    }

    pub fn queue_pause(&self) -> Duration {
        Duration::from_millis(self.queue_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub failures_before_polling: u32,
    pub polling_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            failures_before_polling: 5,
            polling_interval_ms: 5_000,
            poll_timeout_ms: 10_000,
            queue_capacity: 100,
        }
    }
}

pub fn parse_config(contents: &str) -> Result<MomentumConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Load configuration from `path`. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<MomentumConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = match fs::read_to_string(path_ref) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MomentumConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path_ref.to_path_buf(),
                source,
            })
        }
    };
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}
