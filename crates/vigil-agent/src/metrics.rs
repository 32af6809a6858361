// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Prometheus metrics for the agent.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `vigil_agent_oversize_drops_total` | Counter | |
//! | `vigil_agent_rate_limited_total` | Counter | |
//! | `vigil_agent_publish_outcomes_total` | Counter | `outcome` |
//! | `vigil_agent_queue_backlog_bytes` | Gauge | |
//! | `vigil_agent_queue_depth` | Gauge | |
//! | `vigil_agent_queue_evictions_total` | Counter | |
//! | `vigil_agent_queue_dropped_total` | Counter | |
//! | `vigil_agent_queue_retries_total` | Counter | |
//! | `vigil_agent_queue_corrupt_total` | Counter | |
//! | `vigil_agent_transport_failures_total` | Counter | `path` |
//! | `vigil_agent_publish_latency_seconds` | Histogram | |
//!
//! `outcome` is one of `delivered`, `queued_retry`, `queued_transport_error`,
//! `dropped_oversize`, `dropped_rejected` (direct path) or `drained`,
//! `drain_dropped`, `drain_corrupt` (queue replay). `path` is `direct` or
//! `drain`.
//!
//! The `queue_*_total` counters mirror [`QueueStatsSnapshot`] totals. Snapshots
//! may be observed out of order, so each one only ever moves a counter
//! forward to the highest total seen.
//!
//! The registry is owned by whoever builds [`AgentMetrics`]; nothing is
//! registered globally.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use vigil_queue::QueueStatsSnapshot;

/// Latency buckets (seconds) for one publish round trip.
pub const PUBLISH_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Counter that follows a monotonic total kept elsewhere.
#[derive(Clone)]
struct MirroredCounter {
    counter: IntCounter,
    seen: Arc<AtomicU64>,
}

impl MirroredCounter {
    fn register(registry: &Registry, name: &str, help: &str) -> Result<Self, MetricsError> {
        let counter = IntCounter::new(name, help)?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self {
            counter,
            seen: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Advance to `total`; stale (lower) totals are ignored.
    fn advance(&self, total: u64) {
        let previous = self.seen.fetch_max(total, Ordering::AcqRel);
        if total > previous {
            self.counter.inc_by(total - previous);
        }
    }

    fn get(&self) -> u64 {
        self.counter.get()
    }
}

/// Agent metric handles. Cheap to clone.
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    oversize_drops: IntCounter,
    rate_limited: IntCounter,
    publish_outcomes: IntCounterVec,
    transport_failures: IntCounterVec,
    queue_backlog_bytes: IntGauge,
    queue_depth: IntGauge,
    queue_evictions: MirroredCounter,
    queue_dropped: MirroredCounter,
    queue_retries: MirroredCounter,
    queue_corrupt: MirroredCounter,
    publish_latency: Histogram,
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").finish_non_exhaustive()
    }
}

impl AgentMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: Registry) -> Result<Self, MetricsError> {
        let oversize_drops = IntCounter::new(
            "vigil_agent_oversize_drops_total",
            "Envelopes dropped for exceeding max_env_bytes",
        )?;
        registry.register(Box::new(oversize_drops.clone()))?;

        let rate_limited = IntCounter::new(
            "vigil_agent_rate_limited_total",
            "Publishes delayed by the local rate limiter",
        )?;
        registry.register(Box::new(rate_limited.clone()))?;

        let publish_outcomes = IntCounterVec::new(
            Opts::new(
                "vigil_agent_publish_outcomes_total",
                "Publish outcomes by result",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(publish_outcomes.clone()))?;

        let queue_backlog_bytes = IntGauge::new(
            "vigil_agent_queue_backlog_bytes",
            "Serialized bytes waiting in the durable queue",
        )?;
        registry.register(Box::new(queue_backlog_bytes.clone()))?;

        let queue_depth = IntGauge::new(
            "vigil_agent_queue_depth",
            "Envelopes waiting in the durable queue",
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let transport_failures = IntCounterVec::new(
            Opts::new(
                "vigil_agent_transport_failures_total",
                "Publish attempts that failed below the ack level (connect, TLS, timeout)",
            ),
            &["path"],
        )?;
        registry.register(Box::new(transport_failures.clone()))?;

        let queue_evictions = MirroredCounter::register(
            &registry,
            "vigil_agent_queue_evictions_total",
            "Queued envelopes evicted to respect the backlog budget",
        )?;
        let queue_dropped = MirroredCounter::register(
            &registry,
            "vigil_agent_queue_dropped_total",
            "Queued envelopes dropped on broker rejection or after max_retries",
        )?;
        let queue_retries = MirroredCounter::register(
            &registry,
            "vigil_agent_queue_retries_total",
            "Failed transport attempts while replaying the queue",
        )?;
        let queue_corrupt = MirroredCounter::register(
            &registry,
            "vigil_agent_queue_corrupt_total",
            "Queued records removed because they no longer decode",
        )?;

        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "vigil_agent_publish_latency_seconds",
                "Latency of one publish round trip to the broker",
            )
            .buckets(PUBLISH_LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(publish_latency.clone()))?;

        Ok(Self {
            registry,
            oversize_drops,
            rate_limited,
            publish_outcomes,
            transport_failures,
            queue_backlog_bytes,
            queue_depth,
            queue_evictions,
            queue_dropped,
            queue_retries,
            queue_corrupt,
            publish_latency,
        })
    }

    pub fn oversize_drop(&self) {
        self.oversize_drops.inc();
    }

    pub fn oversize_drops(&self) -> u64 {
        self.oversize_drops.get()
    }

    pub fn rate_limited(&self) {
        self.rate_limited.inc();
    }

    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited.get()
    }

    pub fn outcome(&self, outcome: &str) {
        self.outcomes(outcome, 1);
    }

    pub fn outcomes(&self, outcome: &str, count: usize) {
        if count > 0 {
            self.publish_outcomes
                .with_label_values(&[outcome])
                .inc_by(count as u64);
        }
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.publish_outcomes.with_label_values(&[outcome]).get()
    }

    /// `path` is `direct` or `drain`.
    pub fn transport_failure(&self, path: &str) {
        self.transport_failures.with_label_values(&[path]).inc();
    }

    pub fn transport_failure_count(&self, path: &str) -> u64 {
        self.transport_failures.with_label_values(&[path]).get()
    }

    pub fn queue_evictions(&self) -> u64 {
        self.queue_evictions.get()
    }

    pub fn queue_dropped(&self) -> u64 {
        self.queue_dropped.get()
    }

    pub fn observe_latency(&self, seconds: f64) {
        self.publish_latency.observe(seconds);
    }

    /// Mirror queue state into gauges and loss counters.
    pub fn observe_queue(&self, snapshot: &QueueStatsSnapshot) {
        self.queue_depth.set(snapshot.depth as i64);
        self.queue_backlog_bytes
            .set(snapshot.backlog_bytes.min(i64::MAX as u64) as i64);

        self.queue_evictions.advance(snapshot.evicted);
        self.queue_dropped.advance(snapshot.dropped);
        self.queue_retries.advance(snapshot.retries);
        self.queue_corrupt.advance(snapshot.corrupt);
    }

    /// Prometheus text exposition.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
