// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil::signing::{load_public_key, PUBLIC_KEY_LEN};

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

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// TCP port to listen on (default: 7450)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Soft admission limit: at or above it new work gets RETRY
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Absolute ceiling on admitted requests, enforced atomically
    #[serde(default = "default_hard_max")]
    pub hard_max: usize,

    /// Reject everything with RETRY (drill mode)
    #[serde(default)]
    pub overload: bool,

    /// Lower bound of the RETRY backoff hint (ms)
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Upper bound of the RETRY backoff hint (ms)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Maximum frame size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Reject envelopes older than this (seconds, 0 = no limit)
    #[serde(default)]
    pub max_envelope_age_secs: u64,

    /// Recently accepted idempotency keys remembered for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Agent public keys: hex strings or paths to `.pub` files.
    /// Empty disables signature verification.
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    /// Require mutual TLS
    #[serde(default)]
    pub tls: bool,

    /// Directory holding `ca.pem`, `broker.pem`, `broker.key`
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// JSON-lines file accepted envelopes are appended to
    #[serde(default = "default_sink_path")]
    pub sink_path: PathBuf,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7450
}

fn default_max_inflight() -> usize {
    64
}

fn default_hard_max() -> usize {
    128
}

fn default_backoff_min_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    1_000
}

fn default_max_message_size() -> usize {
    vigil::DEFAULT_MAX_FRAME_SIZE
}

fn default_dedup_capacity() -> usize {
    100_000
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("envelopes.jsonl")
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_inflight: default_max_inflight(),
            hard_max: default_hard_max(),
            overload: false,
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_message_size: default_max_message_size(),
            max_envelope_age_secs: 0,
            dedup_capacity: default_dedup_capacity(),
            trusted_keys: Vec::new(),
            tls: false,
            cert_dir: default_cert_dir(),
            sink_path: default_sink_path(),
        }
    }
}

impl BrokerConfig {
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
        if self.max_inflight == 0 {
            return Err(ConfigError::Invalid("max_inflight must be > 0".into()));
        }
        if self.hard_max < self.max_inflight {
            return Err(ConfigError::Invalid(format!(
                "hard_max ({}) must be >= max_inflight ({})",
                self.hard_max, self.max_inflight
            )));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_min_ms ({}) > backoff_max_ms ({})",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedup_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Listen address as `host:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn max_envelope_age(&self) -> Option<Duration> {
        (self.max_envelope_age_secs > 0).then(|| Duration::from_secs(self.max_envelope_age_secs))
    }

    /// Resolve `trusted_keys` into raw Ed25519 public keys.
    pub fn trusted_key_bytes(&self) -> Result<Vec<[u8; PUBLIC_KEY_LEN]>, ConfigError> {
        self.trusted_keys
            .iter()
            .map(|entry| parse_trusted_key(entry))
            .collect()
    }
}

fn parse_trusted_key(entry: &str) -> Result<[u8; PUBLIC_KEY_LEN], ConfigError> {
    let entry = entry.trim();
    if let Ok(bytes) = hex::decode(entry) {
        return <[u8; PUBLIC_KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            ConfigError::Invalid(format!(
                "trusted key '{}' is {} bytes, expected {}",
                entry,
                bytes.len(),
                PUBLIC_KEY_LEN
            ))
        });
    }
    load_public_key(entry).map_err(|e| ConfigError::Invalid(format!("trusted key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil::EnvelopeSigner;

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:7450");
        assert_eq!(config.max_envelope_age(), None);
    }

    #[test]
    fn test_validation() {
        let config = BrokerConfig {
            max_inflight: 10,
            hard_max: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BrokerConfig {
            backoff_min_ms: 500,
            backoff_max_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trusted_keys_hex_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = EnvelopeSigner::from_seed(&[1; 32]);
        let b = EnvelopeSigner::from_seed(&[2; 32]);
        let b_pub = b.save(dir.path().join("b.key")).unwrap();

        let config = BrokerConfig {
            trusted_keys: vec![a.public_key_hex(), b_pub.display().to_string()],
            ..Default::default()
        };
        let keys = config.trusted_key_bytes().unwrap();
        assert_eq!(keys, vec![a.public_key(), b.public_key()]);
    }

    #[test]
    fn test_trusted_key_wrong_length() {
        let config = BrokerConfig {
            trusted_keys: vec!["abcd".into()],
            ..Default::default()
        };
        assert!(config.trusted_key_bytes().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: BrokerConfig = toml::from_str(
            r#"
            port = 9000
            max_inflight = 1
            hard_max = 1
            sink_path = "/var/lib/vigil/envelopes.jsonl"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.backoff_max_ms, 1000);
        assert_eq!(
            config.sink_path,
            PathBuf::from("/var/lib/vigil/envelopes.jsonl")
        );
        assert_eq!(BrokerConfig::default().sink_path, PathBuf::from("envelopes.jsonl"));
    }
}
