// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local send-rate limiter.
//!
//! Token bucket refilled at `rate` envelopes per second with a burst of one
//! second's worth. Callers wait for the next token rather than being
//! rejected.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use vigil::Shutdown;

/// Result of [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Token was available.
    Immediate,
    /// Had to wait for a token.
    Waited,
    /// Shutdown fired while waiting.
    Cancelled,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        let rate = f64::from(rate.max(1));
        Self {
            tokens: rate,
            capacity: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

/// Shared token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// `None` when `rate` is 0 (unlimited).
    pub fn new(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            bucket: Mutex::new(TokenBucket::new(rate)),
        })
    }

    /// Wait for one send slot.
    pub async fn acquire(&self, shutdown: &Shutdown) -> Acquire {
        let mut waited = false;
        loop {
            let wait = match self.bucket.lock().try_take() {
                Ok(()) => {
                    return if waited {
                        Acquire::Waited
                    } else {
                        Acquire::Immediate
                    }
                }
                Err(wait) => wait,
            };
            waited = true;
            if !shutdown.sleep(wait).await {
                return Acquire::Cancelled;
            }
        }
    }
}
