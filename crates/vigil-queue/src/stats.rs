// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queue counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    appended: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    retries: AtomicU64,
    corrupt: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`] plus current depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub appended: u64,
    pub duplicates: u64,
    pub delivered: u64,
    /// Rejected by the broker or out of retries
    pub dropped: u64,
    /// Removed to respect the backlog budget
    pub evicted: u64,
    pub retries: u64,
    pub corrupt: u64,
    pub depth: usize,
    pub backlog_bytes: u64,
}

impl QueueStats {
    pub(crate) fn appended(&self) {
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn corrupt(&self) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, depth: usize, backlog_bytes: u64) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            depth,
            backlog_bytes,
        }
    }
}
