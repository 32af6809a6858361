// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue configuration

use crate::QueueError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backlog budget in bytes; oldest records are evicted beyond it
    pub max_bytes: u64,

    /// Transport failures tolerated per record before it is dropped
    pub max_retries: u32,

    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_retries: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    /// Create a new config builder
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_bytes == 0 {
            return Err(QueueError::InvalidConfig("max_bytes must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(QueueError::InvalidConfig("max_retries must be > 0".into()));
        }
        Ok(())
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    max_bytes: Option<u64>,
    max_retries: Option<u32>,
    busy_timeout_ms: Option<u64>,
}

impl QueueConfigBuilder {
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    pub fn build(self) -> QueueConfig {
        let defaults = QueueConfig::default();

        QueueConfig {
            max_bytes: self.max_bytes.unwrap_or(defaults.max_bytes),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            busy_timeout_ms: self.busy_timeout_ms.unwrap_or(defaults.busy_timeout_ms),
        }
    }
}
