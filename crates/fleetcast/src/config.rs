// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! ```toml
//! host = "worker-3"
//!
//! [broker]
//! address = "10.0.0.5:7420"
//!
//! [presence]
//! interval_ms = 1000
//! timeout_ms = 3000
//!
//! [broadcast]
//! connect_timeout_ms = 5000
//! idle_timeout_ms = 5000
//!
//! [commands.deploy]
//! idle_timeout_ms = 60000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
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

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Host identifier announced to the fleet. See [`FleetConfig::host_id`].
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub presence: PresenceSettings,

    #[serde(default)]
    pub broadcast: BroadcastSettings,

    /// Per-command timeout overrides, keyed by command name.
    #[serde(default)]
    pub commands: HashMap<String, CommandSettings>,
}

/// Where the broker lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `host:port` of the broker (default: 127.0.0.1:7420)
    #[serde(default = "default_broker_address")]
    pub address: String,

    /// Maximum wire frame size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Heartbeat period (default: 1000 ms)
    #[serde(default = "default_presence_interval")]
    pub interval_ms: u64,

    /// A host is alive while `now - last_seen <= timeout` (default: 3000 ms)
    #[serde(default = "default_presence_timeout")]
    pub timeout_ms: u64,
}

/// Conversation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    /// Maximum wait for the first frame (default: 5000 ms)
    #[serde(default = "default_conversation_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum wait between frames once one arrived (default: 5000 ms)
    #[serde(default = "default_conversation_timeout")]
    pub idle_timeout_ms: u64,
}

/// Per-command overrides of [`BroadcastSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

fn default_broker_address() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_max_message_size() -> usize {
    crate::wire::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_presence_interval() -> u64 {
    1000
}

fn default_presence_timeout() -> u64 {
    3000
}

fn default_conversation_timeout() -> u64 {
    5000
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_presence_interval(),
            timeout_ms: default_presence_timeout(),
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_conversation_timeout(),
            idle_timeout_ms: default_conversation_timeout(),
        }
    }
}

impl PresenceSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BroadcastSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(ConfigError::Invalid("host cannot be empty".into()));
            }
        }
        if self.broker.address.is_empty() {
            return Err(ConfigError::Invalid("broker.address cannot be empty".into()));
        }
        if self.broker.max_message_size == 0
            || self.broker.max_message_size > crate::wire::MAX_FRAME_SIZE
        {
            return Err(ConfigError::Invalid(format!(
                "broker.max_message_size must be between 1 and {}",
                crate::wire::MAX_FRAME_SIZE
            )));
        }
        if self.presence.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "presence.interval_ms cannot be 0".into(),
            ));
        }
        if self.presence.timeout_ms <= self.presence.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "presence.timeout_ms ({}) must exceed presence.interval_ms ({})",
                self.presence.timeout_ms, self.presence.interval_ms
            )));
        }
        if self.broadcast.connect_timeout_ms == 0 || self.broadcast.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broadcast timeouts cannot be 0".into(),
            ));
        }
        for (name, command) in &self.commands {
            if command.connect_timeout_ms == Some(0) || command.idle_timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "commands.{} timeouts cannot be 0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Host identifier: configured value, else `$HOSTNAME`, else a generated one.
    pub fn host_id(&self) -> String {
        self.host
            .clone()
            .or_else(|| {
                std::env::var("HOSTNAME")
                    .ok()
                    .filter(|h| !h.trim().is_empty())
            })
            .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
    }

    /// Connect and idle timeouts for a command, after per-command overrides.
    pub fn command_timeouts(&self, command: &str) -> (Duration, Duration) {
        let overrides = self.commands.get(command);
        let connect = overrides
            .and_then(|c| c.connect_timeout_ms)
            .unwrap_or(self.broadcast.connect_timeout_ms);
        let idle = overrides
            .and_then(|c| c.idle_timeout_ms)
            .unwrap_or(self.broadcast.idle_timeout_ms);
        (Duration::from_millis(connect), Duration::from_millis(idle))
    }
}
