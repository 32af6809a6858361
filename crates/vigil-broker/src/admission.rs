// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Admission control.
//!
//! Decides, without ever waiting, whether a publish may start work:
//!
//! 1. Overload drill or in-flight >= `max_inflight` -> reject.
//! 2. Compare-and-swap the in-flight counter towards `hard_max`; losing the
//!    race at the ceiling rejects exactly like step 1.
//! 3. The returned [`AdmissionPermit`] gives the slot back on drop.
//!
//! Rejections carry a backoff hint drawn uniformly from
//! `[backoff_min_ms, backoff_max_ms]` so retrying agents spread out.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Admission limits.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub max_inflight: usize,
    pub hard_max: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub overload: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_inflight: 64,
            hard_max: 128,
            backoff_min_ms: 100,
            backoff_max_ms: 1_000,
            overload: false,
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Overload,
    AtCapacity,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Overload => "overloaded",
            RejectReason::AtCapacity => "at capacity",
        }
    }
}

/// A rejected admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub reason: RejectReason,
    pub backoff_hint_ms: u64,
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AdmissionStats {
    pub inflight: usize,
    pub admitted: u64,
    pub rejected: u64,
}

/// Shared in-flight counter with overload switch.
#[derive(Debug)]
pub struct AdmissionController {
    inflight: Arc<AtomicUsize>,
    overload: AtomicBool,
    max_inflight: usize,
    hard_max: usize,
    backoff_min_ms: u64,
    backoff_max_ms: u64,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let backoff_min_ms = config.backoff_min_ms.min(config.backoff_max_ms);
        Self {
            inflight: Arc::new(AtomicUsize::new(0)),
            overload: AtomicBool::new(config.overload),
            max_inflight: config.max_inflight,
            hard_max: config.hard_max.max(1),
            backoff_min_ms,
            backoff_max_ms: config.backoff_max_ms,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Try to take a slot. Never blocks.
    pub fn try_admit(&self) -> Result<AdmissionPermit, Rejected> {
        if self.overload.load(Ordering::Acquire) {
            return Err(self.reject(RejectReason::Overload));
        }
        if self.inflight.load(Ordering::Acquire) >= self.max_inflight {
            return Err(self.reject(RejectReason::AtCapacity));
        }

        let mut current = self.inflight.load(Ordering::Acquire);
        loop {
            if current >= self.hard_max {
                return Err(self.reject(RejectReason::AtCapacity));
            }
            match self.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(AdmissionPermit {
            inflight: self.inflight.clone(),
        })
    }

    /// Toggle drill mode at runtime.
    pub fn set_overload(&self, enabled: bool) {
        let previous = self.overload.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            tracing::warn!("overload drill {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.overload.load(Ordering::Acquire)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Uniform in `[backoff_min_ms, backoff_max_ms]`.
    pub fn backoff_hint_ms(&self) -> u64 {
        rand::thread_rng().gen_range(self.backoff_min_ms..=self.backoff_max_ms)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            inflight: self.inflight(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, reason: RejectReason) -> Rejected {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Rejected {
            reason,
            backoff_hint_ms: self.backoff_hint_ms(),
        }
    }
}

/// One admitted request. Releases its slot when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    inflight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
