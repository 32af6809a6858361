// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Jittered exponential backoff for the publish path.
//!
//! Every delay is `base + base * uniform(0.2, 0.6)`. After transport
//! failures `base = min(initial * 2^(failures - 1), cap)`; after a broker
//! RETRY the base is the broker's hint, and the failure streak is untouched.

use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.2;

/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 0.6;

/// Backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Base delay after the first failure.
    pub initial: Duration,
    /// Upper bound on the base delay.
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            cap: Duration::from_secs(5),
        }
    }
}

/// Consecutive-failure tracker.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Un-jittered base for the current streak.
    pub fn base_delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.failures - 1).min(31);
        self.config
            .initial
            .saturating_mul(1u32 << exponent)
            .min(self.config.cap)
    }

    /// Record a transport failure and return the delay to wait.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        jitter(self.base_delay())
    }

    /// Delay for a broker RETRY carrying `hint_ms`.
    pub fn on_retry_hint(&self, hint_ms: u64) -> Duration {
        jitter(Duration::from_millis(hint_ms))
    }

    /// Delivery succeeded.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// `base + base * uniform(0.2, 0.6)`.
pub fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
    base + base.mul_f64(factor)
}
