// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control plane configuration.
//!
//! Supports both programmatic and file-based configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Bind address for HTTP and WebSocket.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of closed connections kept in the history ring.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Outbound frames buffered per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Finished cameras older than this are dropped (seconds).
    #[serde(default = "default_camera_retention")]
    pub camera_retention_secs: u64,

    /// Unanswered requests older than this are abandoned (seconds).
    #[serde(default = "default_pending_request_ttl")]
    pub pending_request_ttl_secs: u64,

    /// Retention sweep interval (seconds, 0 to disable).
    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,

    /// Drain timings.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Timings of the graceful drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Per-connection wait for `app_terminated`.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Overall bound on the notify phase.
    #[serde(default = "default_drain_deadline")]
    pub drain_deadline_ms: u64,

    /// Pause between the notify phase and force-closing.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Bound on force-closing the remaining connections.
    #[serde(default = "default_force_close_timeout")]
    pub force_close_timeout_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_history_capacity() -> usize {
    100
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_camera_retention() -> u64 {
    3600
}

fn default_pending_request_ttl() -> u64 {
    300
}

fn default_retention_interval() -> u64 {
    60
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_drain_deadline() -> u64 {
    30_000
}

fn default_grace_period() -> u64 {
    2000
}

fn default_force_close_timeout() -> u64 {
    5000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            drain_deadline_ms: default_drain_deadline(),
            grace_period_ms: default_grace_period(),
            force_close_timeout_ms: default_force_close_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_millis(self.drain_deadline_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn force_close_timeout(&self) -> Duration {
        Duration::from_millis(self.force_close_timeout_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            history_capacity: default_history_capacity(),
            outbound_buffer: default_outbound_buffer(),
            camera_retention_secs: default_camera_retention(),
            pending_request_ttl_secs: default_pending_request_ttl(),
            retention_interval_secs: default_retention_interval(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl ControlConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.is_empty() {
            return Err(ConfigError::Invalid("Empty bind address".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be at least 1".into(),
            ));
        }

        let s = &self.shutdown;
        if s.ack_timeout_ms == 0 || s.drain_deadline_ms == 0 || s.force_close_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "Shutdown timeouts must be non-zero".into(),
            ));
        }
        if s.ack_timeout_ms > s.drain_deadline_ms {
            return Err(ConfigError::Invalid(format!(
                "ack_timeout_ms ({}) exceeds drain_deadline_ms ({})",
                s.ack_timeout_ms, s.drain_deadline_ms
            )));
        }

        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn camera_retention(&self) -> Duration {
        Duration::from_secs(self.camera_retention_secs)
    }

    pub fn pending_request_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_request_ttl_secs)
    }

    /// Zero when the sweeper is disabled.
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.shutdown.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.shutdown.drain_deadline(), Duration::from_secs(30));
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(2));
        assert_eq!(config.shutdown.force_close_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 9100

[shutdown]
grace_period_ms = 500
"#
        )
        .unwrap();

        let config = ControlConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.shutdown.grace_period_ms, 500);
        assert_eq!(config.shutdown.ack_timeout_ms, 5000);
        assert_eq!(config.camera_retention_secs, 3600);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ControlConfig::default();
        config.history_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ControlConfig::default();
        config.shutdown.ack_timeout_ms = 60_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(matches!(
            ControlConfig::from_file(file.path()),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = ControlConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ControlConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.shutdown, config.shutdown);
        assert_eq!(parsed.listen_addr(), "0.0.0.0:8765");
    }
}
