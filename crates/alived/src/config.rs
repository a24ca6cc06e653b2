// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration.

use crate::registry::unit::SweepPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest accepted retention window (about 115 days).
pub const MAX_RETAIN_SECS: u32 = 10_000_000;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind every listener to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// UDP port receiving unit heartbeats
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,

    /// TCP port serving unit state to clients
    #[serde(default = "default_query_port")]
    pub query_port: u16,

    /// UDP port for event subscribers
    #[serde(default = "default_subscription_port")]
    pub subscription_port: u16,

    /// Heartbeats a unit may miss before it is declared down
    #[serde(default = "default_fail_number_heartbeats")]
    pub fail_number_heartbeats: u32,

    /// Startup grace period before the first sweep (seconds)
    #[serde(default = "default_fail_check_period")]
    pub fail_check_period_secs: u32,

    /// Interval between sweeps (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long down incarnations are kept (seconds)
    #[serde(default = "default_instance_retain")]
    pub instance_retain_secs: u32,

    /// Notification tick (milliseconds)
    #[serde(default = "default_notify_tick")]
    pub notify_tick_ms: u64,

    /// Silence after which a confirmed subscriber is dropped (seconds)
    #[serde(default = "default_subscriber_stale")]
    pub subscriber_stale_secs: u32,

    /// Read timeout for query requests (seconds)
    #[serde(default = "default_io_timeout")]
    pub query_timeout_secs: u64,

    /// Timeout of a metadata fetch from a unit (seconds)
    #[serde(default = "default_io_timeout")]
    pub fetch_timeout_secs: u64,

    /// Directory of per-unit state files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory of per-unit binary event logs
    #[serde(default = "default_event_dir")]
    pub event_dir: PathBuf,

    /// Shared text event log
    #[serde(default = "default_event_file")]
    pub event_file: PathBuf,

    /// Metadata fetch log
    #[serde(default = "default_info_file")]
    pub info_file: PathBuf,

    /// UNIX socket of the control channel
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Diagnostic log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_heartbeat_port() -> u16 {
    5678
}

fn default_query_port() -> u16 {
    5679
}

fn default_subscription_port() -> u16 {
    5680
}

fn default_fail_number_heartbeats() -> u32 {
    5
}

fn default_fail_check_period() -> u32 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_instance_retain() -> u32 {
    7 * 24 * 3600
}

fn default_notify_tick() -> u64 {
    200
}

fn default_subscriber_stale() -> u32 {
    300
}

fn default_io_timeout() -> u64 {
    5
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/alived/state")
}

fn default_event_dir() -> PathBuf {
    PathBuf::from("/var/lib/alived/events")
}

fn default_event_file() -> PathBuf {
    PathBuf::from("/var/log/alived/events.log")
}

fn default_info_file() -> PathBuf {
    PathBuf::from("/var/log/alived/info.log")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/alived/control.sock")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            heartbeat_port: default_heartbeat_port(),
            query_port: default_query_port(),
            subscription_port: default_subscription_port(),
            fail_number_heartbeats: default_fail_number_heartbeats(),
            fail_check_period_secs: default_fail_check_period(),
            sweep_interval_secs: default_sweep_interval(),
            instance_retain_secs: default_instance_retain(),
            notify_tick_ms: default_notify_tick(),
            subscriber_stale_secs: default_subscriber_stale(),
            query_timeout_secs: default_io_timeout(),
            fetch_timeout_secs: default_io_timeout(),
            state_dir: default_state_dir(),
            event_dir: default_event_dir(),
            event_file: default_event_file(),
            info_file: default_info_file(),
            control_socket: default_control_socket(),
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            missed_beats: self.fail_number_heartbeats,
            retain_secs: self.instance_retain_secs,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.fail_check_period_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn notify_tick(&self) -> Duration {
        Duration::from_millis(self.notify_tick_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// `(key, value)` pairs in file order, for operator display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Path| p.display().to_string();
        vec![
            ("bind_address", self.bind_address.to_string()),
            ("heartbeat_port", self.heartbeat_port.to_string()),
            ("query_port", self.query_port.to_string()),
            ("subscription_port", self.subscription_port.to_string()),
            ("fail_number_heartbeats", self.fail_number_heartbeats.to_string()),
            ("fail_check_period_secs", self.fail_check_period_secs.to_string()),
            ("sweep_interval_secs", self.sweep_interval_secs.to_string()),
            ("instance_retain_secs", self.instance_retain_secs.to_string()),
            ("notify_tick_ms", self.notify_tick_ms.to_string()),
            ("subscriber_stale_secs", self.subscriber_stale_secs.to_string()),
            ("query_timeout_secs", self.query_timeout_secs.to_string()),
            ("fetch_timeout_secs", self.fetch_timeout_secs.to_string()),
            ("state_dir", path(&self.state_dir)),
            ("event_dir", path(&self.event_dir)),
            ("event_file", path(&self.event_file)),
            ("info_file", path(&self.info_file)),
            ("control_socket", path(&self.control_socket)),
            (
                "log_file",
                self.log_file
                    .as_deref()
                    .map(path)
                    .unwrap_or_else(|| "(stderr)".to_string()),
            ),
        ]
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = [
            ("heartbeat_port", self.heartbeat_port),
            ("query_port", self.query_port),
            ("subscription_port", self.subscription_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(ConfigError::InvalidValue(format!("{} cannot be 0", name)));
            }
        }
        if !(1..=255).contains(&self.fail_number_heartbeats) {
            return Err(ConfigError::InvalidValue(
                "fail_number_heartbeats must be in 1..=255".into(),
            ));
        }
        if !(1..=65535).contains(&self.fail_check_period_secs) {
            return Err(ConfigError::InvalidValue(
                "fail_check_period_secs must be in 1..=65535".into(),
            ));
        }
        if !(1..=MAX_RETAIN_SECS).contains(&self.instance_retain_secs) {
            return Err(ConfigError::InvalidValue(format!(
                "instance_retain_secs must be in 1..={}",
                MAX_RETAIN_SECS
            )));
        }
        let intervals = [
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("notify_tick_ms", self.notify_tick_ms),
            ("query_timeout_secs", self.query_timeout_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("subscriber_stale_secs", u64::from(self.subscriber_stale_secs)),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} cannot be 0", name)));
            }
        }
        let paths = [
            ("state_dir", &self.state_dir),
            ("event_dir", &self.event_dir),
            ("event_file", &self.event_file),
            ("info_file", &self.info_file),
            ("control_socket", &self.control_socket),
        ];
        for (name, p) in paths {
            if p.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue(format!("{} cannot be empty", name)));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_port, 5678);
        assert_eq!(config.query_port, 5679);
        assert_eq!(config.subscription_port, 5680);
        assert_eq!(config.fail_number_heartbeats, 5);
        assert_eq!(config.instance_retain_secs, 604_800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alived.json");
        std::fs::write(&path, r#"{ "heartbeat_port": 6000, "log_file": "/tmp/a.log" }"#)
            .unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.heartbeat_port, 6000);
        assert_eq!(config.query_port, 5679);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/a.log")));
    }

    #[test]
    fn test_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alived.json");
        let config = ServerConfig {
            sweep_interval_secs: 2,
            ..Default::default()
        };
        config.to_file(&path).unwrap();
        let parsed = ServerConfig::from_file(&path).unwrap();
        assert_eq!(parsed.sweep_interval_secs, 2);
        assert_eq!(parsed.state_dir, config.state_dir);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alived.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            ServerConfig::from_file(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_file(&tmp.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_validation_ranges() {
        let zero_port = ServerConfig {
            query_port: 0,
            ..Default::default()
        };
        assert!(zero_port.validate().is_err());

        let too_many = ServerConfig {
            fail_number_heartbeats: 256,
            ..Default::default()
        };
        assert!(too_many.validate().is_err());

        let long_retain = ServerConfig {
            instance_retain_secs: MAX_RETAIN_SECS + 1,
            ..Default::default()
        };
        assert!(long_retain.validate().is_err());

        let no_dir = ServerConfig {
            state_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(no_dir.validate().is_err());
    }

    #[test]
    fn test_entries_cover_every_key() {
        let entries = ServerConfig::default().entries();
        assert_eq!(entries.len(), 18);
        assert_eq!(entries[0], ("bind_address", "0.0.0.0".to_string()));
        assert_eq!(entries[17].1, "(stderr)");
    }
}
