// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration.
//!
//! Loaded from TOML; command-line flags override individual fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil_queue::QueueConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identity, used in logs.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Host name reported by this agent.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker address (`host:port`).
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// DNS name expected in the broker certificate.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Use mutual TLS.
    #[serde(default)]
    pub tls: bool,

    /// Directory holding `ca.pem`, `agent.pem`, `agent.key`.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Ed25519 seed file.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: PathBuf,

    /// SQLite queue file.
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    /// Backlog budget (bytes).
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: u64,

    /// Largest envelope accepted for sending (bytes).
    #[serde(default = "default_max_env_bytes")]
    pub max_env_bytes: usize,

    /// Envelopes per second; 0 disables rate limiting.
    #[serde(default)]
    pub send_rate: u32,

    /// Transport failures tolerated per queued record.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Per-attempt transport timeout (milliseconds).
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Records replayed per drain cycle.
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    /// Sleep between idle drain cycles (milliseconds).
    #[serde(default = "default_drain_idle_ms")]
    pub drain_idle_ms: u64,

    /// Bind address for health and metrics endpoints.
    #[serde(default = "default_health_bind")]
    pub health_bind: String,

    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// May equal `health_port`, in which case one listener serves both.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_agent_id() -> String {
    "vigil-agent".to_string()
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_broker_address() -> String {
    "127.0.0.1:7450".to_string()
}

fn default_server_name() -> String {
    "broker.vigil.local".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_signing_key_path() -> PathBuf {
    PathBuf::from("agent.key")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("vigil-queue.db")
}

fn default_max_queue_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_env_bytes() -> usize {
    256 * 1024
}

fn default_retry_max() -> u32 {
    5
}

fn default_retry_timeout_ms() -> u64 {
    2_000
}

fn default_drain_batch() -> usize {
    100
}

fn default_drain_idle_ms() -> u64 {
    1_000
}

fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_health_port() -> u16 {
    9464
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            host: default_host(),
            broker_address: default_broker_address(),
            server_name: default_server_name(),
            tls: false,
            cert_dir: default_cert_dir(),
            signing_key_path: default_signing_key_path(),
            queue_path: default_queue_path(),
            max_queue_bytes: default_max_queue_bytes(),
            max_env_bytes: default_max_env_bytes(),
            send_rate: 0,
            retry_max: default_retry_max(),
            retry_timeout_ms: default_retry_timeout_ms(),
            drain_batch: default_drain_batch(),
            drain_idle_ms: default_drain_idle_ms(),
            health_bind: default_health_bind(),
            health_port: default_health_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.is_empty() {
            return Err(ConfigError::Invalid("broker_address is empty".into()));
        }
        if self.max_env_bytes == 0 {
            return Err(ConfigError::Invalid("max_env_bytes must be > 0".into()));
        }
        if self.max_queue_bytes < self.max_env_bytes as u64 {
            return Err(ConfigError::Invalid(format!(
                "max_queue_bytes ({}) smaller than max_env_bytes ({})",
                self.max_queue_bytes, self.max_env_bytes
            )));
        }
        if self.retry_max == 0 {
            return Err(ConfigError::Invalid("retry_max must be > 0".into()));
        }
        if self.retry_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry_timeout_ms must be > 0".into()));
        }
        if self.drain_batch == 0 {
            return Err(ConfigError::Invalid("drain_batch must be > 0".into()));
        }
        if self.tls && self.server_name.is_empty() {
            return Err(ConfigError::Invalid(
                "server_name is required when tls is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::builder()
            .max_bytes(self.max_queue_bytes)
            .max_retries(self.retry_max)
            .build()
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn drain_idle(&self) -> Duration {
        Duration::from_millis(self.drain_idle_ms)
    }
}
