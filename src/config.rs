// SPDX-License-Identifier: MIT

//! Listener configuration: file-based (TOML) and programmatic construction,
//! matching the option table in spec.md §6.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smq,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub directory: String,

    #[serde(default = "default_bucket_size")]
    pub bucket_size: u64,
}

fn default_bucket_size() -> u64 {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQueueConfig {
    #[serde(default = "default_high_water")]
    pub high_water: usize,
}

fn default_high_water() -> usize {
    1024
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle: u64,

    #[serde(default = "default_drain_timeout")]
    pub drain: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    5
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            idle: default_idle_timeout(),
            drain: default_drain_timeout(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connect_duration(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs(self.idle)
    }

    pub fn drain_duration(&self) -> Duration {
        Duration::from_secs(self.drain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub protocol: Protocol,
    pub bind: String,
    pub auth: AuthConfig,
    pub storage: StorageConfig,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub send_queue: SendQueueConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_workers() -> usize {
    0 // resolved to hardware parallelism by the worker pool
}

impl ListenerConfig {
    /// Load configuration from a TOML file, validating it before returning.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty".into()));
        }
        if self.auth.user.is_empty() {
            return Err(ConfigError::Invalid("auth.user must not be empty".into()));
        }
        if self.storage.directory.is_empty() {
            return Err(ConfigError::Invalid("storage.directory must not be empty".into()));
        }
        if self.storage.bucket_size < 4096 {
            return Err(ConfigError::Invalid(
                "storage.bucket_size must be at least 4096 bytes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            protocol = "smq"
            bind = "127.0.0.1:9000"

            [auth]
            user = "u"
            secret = "s"

            [storage]
            directory = "/tmp/smq"
        "#;
        let config: ListenerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.protocol, Protocol::Smq);
        assert_eq!(config.storage.bucket_size, default_bucket_size());
        assert_eq!(config.send_queue.high_water, default_high_water());
        assert_eq!(config.timeouts.connect, default_connect_timeout());
        config.validate().unwrap();
    }

    #[test]
    fn rejects_empty_bind() {
        let toml = r#"
            protocol = "mqtt"
            bind = ""

            [auth]
            user = "u"
            secret = "s"

            [storage]
            directory = "/tmp/smq"
        "#;
        let config: ListenerConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
