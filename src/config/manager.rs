//! Manager configuration
//!
//! Loads settings from an optional `workroom.toml`. A missing file yields
//! the defaults; a present but malformed file is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = "workroom.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional authentication token; advertised via `hello.requires_auth`
    #[serde(default)]
    pub token: Option<String>,
    /// Root directory holding `repos/` (bare mirrors) and `worktrees/`
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    /// Working directory for sessions created without a cwd or repository
    #[serde(default = "default_cwd")]
    pub default_cwd: PathBuf,
    /// Bounded wait for a single git subprocess call, in seconds
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    /// Idle heartbeat interval for index reconciliation, in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Client-side delay before the single reconnect attempt, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8777
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("projects")
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_git_timeout_secs() -> u64 {
    120
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            token: None,
            projects_dir: default_projects_dir(),
            default_cwd: default_cwd(),
            git_timeout_secs: default_git_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Socket address string for the listener
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Bounded wait for git subprocess calls
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// Idle heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Delay before the client's single reconnect attempt
    #[allow(dead_code)]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
