//! Configuration for workers participating in a synchronized job.
//!
//! Configuration is parsed from TOML, with environment variable
//! overrides prefixed `GSYNC_`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Worker-side configuration consumed by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address this worker's collective transport listens on.
    pub listen_address: String,
    /// Address of the membership registry (coordinator).
    pub coordinator_address: String,
    /// Number of workers per node. Drives local-rank and leadership.
    pub local_group_size: u32,
    /// Interval between heartbeats to the registry, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Registry-side liveness timeout, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Connection timeout for dialing peers and the registry.
    pub connect_timeout_ms: u64,
    /// Per-request timeout for registry calls.
    pub request_timeout_ms: u64,
    /// Maximum registry reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Initial delay between reconnect attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:50200".to_string(),
            coordinator_address: "127.0.0.1:50100".to_string(),
            local_group_size: 1,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 100,
        }
    }
}

impl FromStr for WorkerConfig {
    type Err = SyncError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| SyncError::validation(format!("failed to parse TOML config: {e}")))
    }
}

impl WorkerConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::validation(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `GSYNC_`, for example:
    // - `GSYNC_COORDINATOR_ADDRESS` overrides `coordinator_address`
    // - `GSYNC_LOCAL_GROUP_SIZE` overrides `local_group_size`
    // - `GSYNC_HEARTBEAT_TIMEOUT_MS` overrides `heartbeat_timeout_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("GSYNC_LISTEN_ADDRESS") {
            self.listen_address = val;
        }
        if let Ok(val) = std::env::var("GSYNC_COORDINATOR_ADDRESS") {
            self.coordinator_address = val;
        }
        if let Ok(val) = std::env::var("GSYNC_LOCAL_GROUP_SIZE") {
            if let Ok(v) = val.parse() {
                self.local_group_size = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_HEARTBEAT_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.heartbeat_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.heartbeat_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.request_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.max_reconnect_attempts = v;
            }
        }
        if let Ok(val) = std::env::var("GSYNC_RECONNECT_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.reconnect_delay_ms = v;
            }
        }
        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            return Err(SyncError::validation("listen_address must not be empty"));
        }
        if self.coordinator_address.is_empty() {
            return Err(SyncError::validation(
                "coordinator_address must not be empty",
            ));
        }
        if self.local_group_size == 0 {
            return Err(SyncError::validation(
                "local_group_size must be greater than 0",
            ));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(SyncError::validation(
                "heartbeat_timeout_ms must be greater than 0",
            ));
        }
        if self.heartbeat_interval_ms >= self.heartbeat_timeout_ms {
            return Err(SyncError::validation(
                "heartbeat_interval_ms must be less than heartbeat_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
