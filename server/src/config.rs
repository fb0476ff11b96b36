//! Server configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then the
//! command line. Every field has a default so a partial file is fine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Stream (TCP) transport port.
    pub port: u16,
    /// WebSocket port. Defaults to `port + 1`; port 0 stays 0 (ephemeral).
    pub websocket_port: Option<u16>,
    pub enable_stream: bool,
    pub enable_websocket: bool,
    pub max_clients: usize,
    /// Ticks per second.
    pub tick_rate: u32,
    pub handshake_timeout_ms: u64,
    /// How long a partially received frame may take to complete.
    pub frame_timeout_ms: u64,
    /// Sessions silent for longer than this are evicted.
    pub idle_timeout_secs: u64,
    /// Stale-session scan runs every this many ticks.
    pub maintenance_interval_ticks: u32,
    /// Consecutive overrunning ticks before the loop reports sustained overrun.
    pub overrun_report_threshold: u32,
    pub key_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5400,
            websocket_port: None,
            enable_stream: true,
            enable_websocket: true,
            max_clients: 64,
            tick_rate: 30,
            handshake_timeout_ms: 5_000,
            frame_timeout_ms: 10_000,
            idle_timeout_secs: 30,
            maintenance_interval_ticks: 30,
            overrun_report_threshold: 10,
            key_file: PathBuf::from("server_key.b64"),
        }
    }
}

impl ServerConfig {
    /// Reads a TOML file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be positive".into()));
        }
        if !self.enable_stream && !self.enable_websocket {
            return Err(ConfigError::Invalid(
                "at least one transport must be enabled".into(),
            ));
        }
        if self.maintenance_interval_ticks == 0 {
            return Err(ConfigError::Invalid(
                "maintenance_interval_ticks must be positive".into(),
            ));
        }
        if self.enable_stream
            && self.enable_websocket
            && self.port != 0
            && self.websocket_port() == self.port
        {
            return Err(ConfigError::Invalid(format!(
                "stream and websocket transports cannot share port {}",
                self.port
            )));
        }
        Ok(())
    }

    pub fn websocket_port(&self) -> u16 {
        match self.websocket_port {
            Some(port) => port,
            None if self.port == 0 => 0,
            None => self.port.saturating_add(1),
        }
    }

    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn websocket_addr(&self) -> String {
        format!("{}:{}", self.host, self.websocket_port())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
