//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub instance: InstanceConfig,
    pub network: NetworkConfig,
    pub sessions: SessionSettings,
    pub mediator: MediatorSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Name of this process behind the load balancer. Empty = random.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_addr: String,
    /// TCP port for client connections. 0 = OS-assigned.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// A live session with no activity for this long is failed by the sweeper.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a terminal record lingers so late messages are no-ops.
    pub grace_period_secs: u64,
    /// Max sent-but-unacknowledged chunks per session.
    pub flow_window: u32,
    /// Optimistic write attempts before giving up.
    pub cas_retries: u32,
    /// Mediator publish attempts before failing the session.
    pub publish_retries: u32,
    pub publish_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorSettings {
    /// Per-channel buffer of the in-process mediator.
    pub channel_capacity: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 7878,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            sweep_interval_secs: 5,
            grace_period_secs: 5,
            flow_window: 8,
            cas_retries: 5,
            publish_retries: 3,
            publish_backoff_ms: 50,
        }
    }
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FERRY_* overrides. `lookup` is the environment in production
    /// and a map in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }

        if let Some(v) = lookup("FERRY_INSTANCE__ID") {
            self.instance.id = v;
        }
        if let Some(v) = lookup("FERRY_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(p) = parsed(lookup("FERRY_NETWORK__PORT")) {
            self.network.port = p;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__IDLE_TIMEOUT_SECS")) {
            self.sessions.idle_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__SWEEP_INTERVAL_SECS")) {
            self.sessions.sweep_interval_secs = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__GRACE_PERIOD_SECS")) {
            self.sessions.grace_period_secs = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__FLOW_WINDOW")) {
            self.sessions.flow_window = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__CAS_RETRIES")) {
            self.sessions.cas_retries = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__PUBLISH_RETRIES")) {
            self.sessions.publish_retries = v;
        }
        if let Some(v) = parsed(lookup("FERRY_SESSIONS__PUBLISH_BACKOFF_MS")) {
            self.sessions.publish_backoff_ms = v;
        }
        if let Some(v) = parsed(lookup("FERRY_MEDIATOR__CHANNEL_CAPACITY")) {
            self.mediator.channel_capacity = v;
        }
    }
}
