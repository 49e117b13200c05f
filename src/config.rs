//! Configuration for the agent and gateway binaries
//!
//! Both load an optional TOML file and apply CLI overrides on top. Every
//! field has a default so a bare `agent` / `gateway 8888` works without a
//! file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Agent-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control port; the data channel listens on `port + 1`.
    #[serde(default = "default_agent_port")]
    pub port: u16,

    /// Name carried in discovery announcements.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Hostname advertised to gateways; empty means "use sender IP".
    /// Set explicitly when broadcasting through NAT (e.g. Docker Desktop,
    /// where `host.docker.internal` is required).
    #[serde(default)]
    pub advertised_host: String,

    /// Shell command producing H.264 Annex-B on stdout for the monitor.
    #[serde(default)]
    pub monitor_command: Option<String>,

    /// Same for the webcam.
    #[serde(default)]
    pub webcam_command: Option<String>,

    /// Per-subscriber bounded queue size on the broadcast buses.
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,

    /// Discovery announcement interval.
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            port: default_agent_port(),
            service_name: default_service_name(),
            advertised_host: String::new(),
            monitor_command: None,
            webcam_command: None,
            max_queue_size: default_max_queue(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
        }
    }
}

impl AgentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 || self.port == u16::MAX {
            return Err(ConfigError::Invalid(format!(
                "port must leave room for the data channel, got {}",
                self.port
            )));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "max_queue_size must be > 0".to_string(),
            ));
        }
        if self.broadcast_interval_ms < 100 {
            return Err(ConfigError::Invalid(format!(
                "broadcast_interval_ms must be >= 100, got {}",
                self.broadcast_interval_ms
            )));
        }
        Ok(())
    }

    pub fn data_port(&self) -> u16 {
        self.port + 1
    }
}

/// Gateway-side settings. The caps and timeouts mirror the deployed
/// defaults; none of them are on the CLI surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_max_backends")]
    pub max_backends: usize,

    /// Seconds with no client traffic before the connection is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Per-client ingress cap per sliding second; 0 disables.
    #[serde(default)]
    pub max_bytes_per_sec: u32,

    /// Re-dial interval for disconnected agents.
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            ws_port: default_ws_port(),
            max_clients: default_max_clients(),
            max_backends: default_max_backends(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_bytes_per_sec: 0,
            reconnect_secs: default_reconnect_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_port == 0 {
            return Err(ConfigError::Invalid("ws_port must be > 0".to_string()));
        }
        if self.max_clients == 0 || self.max_clients > 1024 {
            return Err(ConfigError::Invalid(format!(
                "max_clients must be in 1..=1024, got {}",
                self.max_clients
            )));
        }
        if self.max_backends == 0 {
            return Err(ConfigError::Invalid("max_backends must be > 0".to_string()));
        }
        Ok(())
    }
}

fn default_agent_port() -> u16 {
    9090
}
fn default_service_name() -> String {
    "Universal Agent".to_string()
}
fn default_max_queue() -> usize {
    60
}
fn default_broadcast_interval_ms() -> u64 {
    5000
}
fn default_ws_port() -> u16 {
    8888
}
fn default_max_clients() -> usize {
    64
}
fn default_max_backends() -> usize {
    16
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_reconnect_secs() -> u64 {
    5
}
