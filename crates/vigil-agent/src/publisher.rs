// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish client and retry state machine.
//!
//! ```text
//!              +--> DELIVERED   broker OK
//! ATTEMPTING --+--> QUEUED      transport failure or broker RETRY
//!              +--> DROPPED     oversize, or broker INVALID / ERROR
//! ```
//!
//! Expected network trouble is always an outcome, never an error:
//! [`PublishError`] only reports local faults.

use crate::backoff::{Backoff, BackoffConfig};
use crate::metrics::AgentMetrics;
use crate::rate::{Acquire, RateLimiter};
use crate::transport::{Transport, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use vigil::{AckStatus, Envelope, EnvelopeError, PublishAck, Shutdown};
use vigil_queue::{DrainHalt, DrainReport, DurableQueue, QueueError};

/// Why an envelope was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Serialized size above `max_env_bytes`.
    Oversize { size: usize, max: usize },
    /// Broker answered INVALID or ERROR.
    Rejected { status: AckStatus, reason: String },
}

/// Terminal state of one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Queued,
    Dropped(DropReason),
}


/// Local faults.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("agent is shutting down")]
    ShuttingDown,

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] EnvelopeError),
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_env_bytes: usize,
    /// Envelopes per second; 0 = unlimited.
    pub send_rate: u32,
    /// Bound on one transport round trip.
    pub attempt_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_env_bytes: 256 * 1024,
            send_rate: 0,
            attempt_timeout: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Delivers envelopes directly, falling back to the durable queue.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    queue: Arc<DurableQueue>,
    metrics: AgentMetrics,
    limiter: Option<RateLimiter>,
    backoff: Mutex<Backoff>,
    hold_until: Mutex<Option<Instant>>,
    config: PublisherConfig,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<DurableQueue>,
        metrics: AgentMetrics,
        config: PublisherConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transport,
            queue,
            metrics,
            limiter: RateLimiter::new(config.send_rate),
            backoff: Mutex::new(Backoff::new(config.backoff)),
            hold_until: Mutex::new(None),
            config,
            shutdown,
        }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    /// Run one envelope through the state machine.
    pub async fn publish(&self, envelope: &Envelope) -> Result<PublishOutcome, PublishError> {
        if self.shutdown.is_triggered() {
            return Err(PublishError::ShuttingDown);
        }

        let size = envelope.encoded_len()?;
        if size > self.config.max_env_bytes {
            tracing::warn!(
                "dropping oversize envelope {} ({} > {} bytes)",
                envelope.idempotency_key,
                size,
                self.config.max_env_bytes
            );
            self.metrics.oversize_drop();
            self.metrics.outcome("dropped_oversize");
            return Ok(PublishOutcome::Dropped(DropReason::Oversize {
                size,
                max: self.config.max_env_bytes,
            }));
        }

        if let Some(limiter) = &self.limiter {
            match limiter.acquire(&self.shutdown).await {
                Acquire::Immediate => {}
                Acquire::Waited => self.metrics.rate_limited(),
                Acquire::Cancelled => return Err(PublishError::ShuttingDown),
            }
        }

        if !self.wait_for_gate().await {
            return Err(PublishError::ShuttingDown);
        }

        let (outcome, label) = match self.send(envelope).await {
            Err(e) => {
                self.metrics.transport_failure("direct");
                self.enqueue(envelope)?;
                let delay = self.backoff.lock().on_failure();
                self.hold_for(delay);
                tracing::warn!(
                    "publish of {} failed ({}); queued, pausing {:?}",
                    envelope.idempotency_key,
                    e,
                    delay
                );
                (PublishOutcome::Queued, "queued_transport_error")
            }
            Ok(ack) => self.apply_ack(envelope, ack)?,
        };
        self.metrics.outcome(label);
        Ok(outcome)
    }

    /// One bounded round trip; shared with the drain loop. Does not consult
    /// the backoff gate.
    pub async fn send(&self, envelope: &Envelope) -> Result<PublishAck, TransportError> {
        let start = Instant::now();
        let result =
            match tokio::time::timeout(self.config.attempt_timeout, self.transport.publish(envelope))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.attempt_timeout)),
            };
        self.metrics
            .observe_latency(start.elapsed().as_secs_f64());
        result
    }

    fn apply_ack(
        &self,
        envelope: &Envelope,
        ack: PublishAck,
    ) -> Result<(PublishOutcome, &'static str), PublishError> {
        Ok(match ack.status {
            AckStatus::Ok => {
                self.on_delivered();
                tracing::debug!("delivered {}", envelope.idempotency_key);
                (PublishOutcome::Delivered, "delivered")
            }
            AckStatus::Retry => {
                self.enqueue(envelope)?;
                let delay = self.backoff.lock().on_retry_hint(ack.backoff_hint_ms);
                self.hold_for(delay);
                tracing::debug!(
                    "broker busy ({}); queued {}, pausing {:?}",
                    ack.reason,
                    envelope.idempotency_key,
                    delay
                );
                (PublishOutcome::Queued, "queued_retry")
            }
            AckStatus::Invalid | AckStatus::Error => {
                tracing::warn!(
                    "broker rejected {} ({}): {}",
                    envelope.idempotency_key,
                    ack.status,
                    ack.reason
                );
                (
                    PublishOutcome::Dropped(DropReason::Rejected {
                        status: ack.status,
                        reason: ack.reason,
                    }),
                    "dropped_rejected",
                )
            }
        })
    }

    fn on_delivered(&self) {
        self.backoff.lock().reset();
        *self.hold_until.lock() = None;
    }

    /// Feed a drain cycle's result into the shared backoff, so direct
    /// publishes and the next cycle both respect it.
    pub(crate) fn on_drain_report(&self, report: &DrainReport) -> Option<Duration> {
        let delay = match &report.halted {
            Some(DrainHalt::Retry { backoff_hint_ms }) => {
                self.backoff.lock().on_retry_hint(*backoff_hint_ms)
            }
            Some(DrainHalt::Transport { .. }) => self.backoff.lock().on_failure(),
            None => {
                if report.delivered > 0 {
                    self.on_delivered();
                }
                return None;
            }
        };
        self.hold_for(delay);
        Some(delay)
    }

    fn enqueue(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if !self.queue.append(envelope)? {
            tracing::debug!("{} already queued", envelope.idempotency_key);
        }
        self.metrics.observe_queue(&self.queue.stats());
        Ok(())
    }

    fn hold_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut hold = self.hold_until.lock();
        if hold.map_or(true, |current| current < until) {
            *hold = Some(until);
        }
    }

    /// Time left on the backoff gate, if any.
    pub(crate) fn hold_remaining(&self) -> Option<Duration> {
        let until = (*self.hold_until.lock())?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Wait out the backoff gate. False if shutdown fired first.
    ///
    /// Loops because another failure may extend the hold while we sleep.
    pub(crate) async fn wait_for_gate(&self) -> bool {
        while let Some(remaining) = self.hold_remaining() {
            if !self.shutdown.sleep(remaining).await {
                return false;
            }
        }
        !self.shutdown.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope, StubTransport};
    use prometheus::Registry;
    use vigil_queue::QueueConfig;

    fn publisher(stub: Arc<StubTransport>, config: PublisherConfig) -> (Publisher, Shutdown) {
        let shutdown = Shutdown::new();
        let queue = Arc::new(DurableQueue::open_in_memory(QueueConfig::default()).unwrap());
        let metrics = AgentMetrics::new(Registry::new()).unwrap();
        (
            Publisher::new(stub, queue, metrics, config, shutdown.clone()),
            shutdown,
        )
    }

    fn fast() -> PublisherConfig {
        PublisherConfig {
            backoff: BackoffConfig {
                initial: Duration::from_millis(1),
                cap: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_oversize_never_reaches_queue_or_wire() {
        let stub = Arc::new(StubTransport::default());
        let (p, _s) = publisher(
            stub.clone(),
            PublisherConfig {
                max_env_bytes: 128,
                ..fast()
            },
        );

        let before = p.queue().size();
        let outcome = p.publish(&envelope("big", 4096)).await.unwrap();

        assert!(matches!(
            outcome,
            PublishOutcome::Dropped(DropReason::Oversize { max: 128, .. })
        ));
        assert_eq!(p.queue().size(), before);
        assert_eq!(p.metrics().oversize_drops(), 1);
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_ok_is_delivered_without_queue() {
        let stub = Arc::new(StubTransport::default());
        let (p, _s) = publisher(stub.clone(), fast());

        assert_eq!(
            p.publish(&envelope("k1", 8)).await.unwrap(),
            PublishOutcome::Delivered
        );
        assert!(p.queue().is_empty());
        assert_eq!(p.metrics().outcome_count("delivered"), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_queues_and_backs_off() {
        let stub = Arc::new(StubTransport::scripted(vec![Err(TransportError::Other(
            "connection refused".into(),
        ))]));
        let (p, _s) = publisher(stub.clone(), fast());

        assert_eq!(
            p.publish(&envelope("k1", 8)).await.unwrap(),
            PublishOutcome::Queued
        );
        assert_eq!(p.queue().size(), 1);
        assert_eq!(p.backoff.lock().failures(), 1);
        assert!(p.hold_until.lock().is_some());
        assert_eq!(p.metrics().outcome_count("queued_transport_error"), 1);
        assert_eq!(p.metrics().transport_failure_count("direct"), 1);

        // Next success resets the streak.
        assert_eq!(
            p.publish(&envelope("k2", 8)).await.unwrap(),
            PublishOutcome::Delivered
        );
        assert_eq!(p.backoff.lock().failures(), 0);
    }

    #[tokio::test]
    async fn test_retry_ack_queues() {
        let stub = Arc::new(StubTransport::scripted(vec![Ok(PublishAck::retry(
            "overloaded",
            1,
        ))]));
        let (p, _s) = publisher(stub, fast());

        assert_eq!(
            p.publish(&envelope("k1", 8)).await.unwrap(),
            PublishOutcome::Queued
        );
        assert_eq!(p.queue().peek(1).unwrap()[0].idempotency_key, "k1");
        assert_eq!(p.metrics().outcome_count("queued_retry"), 1);
        assert_eq!(p.metrics().outcome_count("queued_transport_error"), 0);
        assert_eq!(p.metrics().transport_failure_count("direct"), 0);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_dropped_not_queued() {
        let stub = Arc::new(StubTransport::scripted(vec![
            Ok(PublishAck::invalid("missing timestamp")),
            Ok(PublishAck::error("signature verification failed")),
        ]));
        let (p, _s) = publisher(stub, fast());

        for key in ["a", "b"] {
            let outcome = p.publish(&envelope(key, 8)).await.unwrap();
            assert!(matches!(
                outcome,
                PublishOutcome::Dropped(DropReason::Rejected { .. })
            ));
        }
        assert!(p.queue().is_empty());
        assert_eq!(p.metrics().outcome_count("dropped_rejected"), 2);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_refused() {
        let stub = Arc::new(StubTransport::default());
        let (p, shutdown) = publisher(stub.clone(), fast());
        shutdown.trigger();

        assert!(matches!(
            p.publish(&envelope("k1", 8)).await,
            Err(PublishError::ShuttingDown)
        ));
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_bounded_by_timeout() {
        let stub = Arc::new(StubTransport::default().with_delay(Duration::from_secs(60)));
        let (p, _s) = publisher(
            stub,
            PublisherConfig {
                attempt_timeout: Duration::from_millis(100),
                ..fast()
            },
        );

        assert_eq!(
            p.publish(&envelope("k1", 8)).await.unwrap(),
            PublishOutcome::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_counted() {
        let stub = Arc::new(StubTransport::default());
        let (p, _s) = publisher(
            stub,
            PublisherConfig {
                send_rate: 1,
                ..fast()
            },
        );

        p.publish(&envelope("k1", 8)).await.unwrap();
        p.publish(&envelope("k2", 8)).await.unwrap();
        assert_eq!(p.metrics().rate_limited_count(), 1);
    }
}
