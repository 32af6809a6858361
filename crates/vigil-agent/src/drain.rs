// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background replay of the durable queue.

use crate::publisher::Publisher;
use std::sync::Arc;
use std::time::Duration;
use vigil::{Envelope, Shutdown};
use vigil_queue::{DrainHalt, DrainReport, QueueError};

/// Replays queued envelopes through the publisher's transport path.
#[derive(Debug)]
pub struct DrainLoop {
    publisher: Arc<Publisher>,
    batch: usize,
    idle: Duration,
    shutdown: Shutdown,
}

impl DrainLoop {
    pub fn new(publisher: Arc<Publisher>, batch: usize, idle: Duration, shutdown: Shutdown) -> Self {
        Self {
            publisher,
            batch,
            idle,
            shutdown,
        }
    }

    /// Run a single drain cycle.
    ///
    /// Waits out the publisher's backoff gate first, and feeds a halted
    /// cycle back into it, so replay and direct publishes share one pause.
    /// Returns an empty report if shutdown fires while waiting.
    pub async fn run_once(&self) -> Result<DrainReport, QueueError> {
        if !self.publisher.wait_for_gate().await {
            return Ok(DrainReport::default());
        }

        let publisher = self.publisher.clone();
        let report = self
            .publisher
            .queue()
            .drain_report(
                move |envelope: Envelope| {
                    let publisher = publisher.clone();
                    async move { publisher.send(&envelope).await }
                },
                self.batch,
            )
            .await?;

        let metrics = self.publisher.metrics();
        metrics.outcomes("drained", report.delivered);
        metrics.outcomes("drain_dropped", report.dropped);
        metrics.outcomes("drain_corrupt", report.corrupt);
        if matches!(report.halted, Some(DrainHalt::Transport { .. })) {
            metrics.transport_failure("drain");
        }
        metrics.observe_queue(&self.publisher.queue().stats());

        let hold = self.publisher.on_drain_report(&report);
        if !report.is_idle() {
            tracing::debug!(
                "drain cycle: delivered={} dropped={} corrupt={} halted={:?} hold={:?}",
                report.delivered,
                report.dropped,
                report.corrupt,
                report.halted,
                hold
            );
        }
        Ok(report)
    }

    /// Loop until shutdown.
    pub async fn run(self) {
        tracing::info!(
            "drain loop started (batch={}, idle={:?})",
            self.batch,
            self.idle
        );
        while !self.shutdown.is_triggered() {
            let pause = match self.run_once().await {
                Ok(report) => self.pause_after(&report),
                Err(e) => {
                    tracing::error!("drain cycle failed: {}", e);
                    self.idle
                }
            };
            if !pause.is_zero() && !self.shutdown.sleep(pause).await {
                break;
            }
        }
        tracing::info!("drain loop stopped");
    }

    /// Idle time before the next cycle. Backoff after a halt is carried by
    /// the publisher's gate, which `run_once` waits on.
    fn pause_after(&self, report: &DrainReport) -> Duration {
        match &report.halted {
            Some(_) => self.idle,
            // A full batch means more may be waiting.
            None if report.delivered + report.dropped + report.corrupt >= self.batch => {
                Duration::ZERO
            }
            None => self.idle,
        }
    }
}
