// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent runtime: wires config, signing, queue, transport and HTTP together.

use crate::config::{AgentConfig, ConfigError};
use crate::drain::DrainLoop;
use crate::health::{self, HealthState};
use crate::metrics::{AgentMetrics, MetricsError};
use crate::publisher::{PublishError, PublishOutcome, Publisher, PublisherConfig};
use crate::transport::{BrokerClient, Transport};
use prometheus::Registry;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use vigil::{DetectorEvent, EnvelopeSigner, Sealer, Shutdown, SigningError, TlsConfig, TlsError};
use vigil_queue::{DurableQueue, QueueError};

/// Startup and runtime failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("signing key error: {0}")]
    Signing(#[from] SigningError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counts from one collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectSummary {
    pub events: u64,
    pub delivered: u64,
    pub queued: u64,
    pub dropped: u64,
    pub malformed: u64,
}

/// One running agent.
pub struct Agent {
    config: AgentConfig,
    sealer: Sealer,
    publisher: Arc<Publisher>,
    health: Arc<HealthState>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.config.agent_id)
            .field("broker", &self.config.broker_address)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Build an agent from configuration.
    ///
    /// A missing or malformed signing key aborts startup.
    pub fn new(config: AgentConfig, shutdown: Shutdown) -> Result<Self, AgentError> {
        config.validate()?;

        let signer = EnvelopeSigner::load(&config.signing_key_path)?;
        tracing::info!(
            "signing key loaded from {} (public key {})",
            config.signing_key_path.display(),
            signer.public_key_hex()
        );

        let queue = Arc::new(DurableQueue::open(&config.queue_path, config.queue_config())?);
        tracing::info!(
            "queue opened at {} ({} pending, {} bytes)",
            config.queue_path.display(),
            queue.size(),
            queue.backlog_bytes()
        );

        let transport: Arc<dyn Transport> = if config.tls {
            let tls = TlsConfig::from_cert_dir(&config.cert_dir, "agent")?;
            Arc::new(BrokerClient::with_tls(
                config.broker_address.clone(),
                config.retry_timeout(),
                tls,
                &config.server_name,
            )?)
        } else {
            tracing::warn!("TLS disabled; talking to broker in plaintext");
            Arc::new(BrokerClient::new(
                config.broker_address.clone(),
                config.retry_timeout(),
            ))
        };

        Self::with_parts(config, Sealer::new(signer), queue, transport, shutdown)
    }

    /// Build an agent around an existing queue and transport.
    pub fn with_parts(
        config: AgentConfig,
        sealer: Sealer,
        queue: Arc<DurableQueue>,
        transport: Arc<dyn Transport>,
        shutdown: Shutdown,
    ) -> Result<Self, AgentError> {
        let metrics = AgentMetrics::new(Registry::new())?;
        let health = Arc::new(HealthState::new(metrics.clone()));
        health.set_queue(queue.clone());

        let publisher = Arc::new(Publisher::new(
            transport,
            queue,
            metrics,
            PublisherConfig {
                max_env_bytes: config.max_env_bytes,
                send_rate: config.send_rate,
                attempt_timeout: config.retry_timeout(),
                ..Default::default()
            },
            shutdown.clone(),
        ));
        health.set_transport_ready();

        Ok(Self {
            config,
            sealer,
            publisher,
            health,
            shutdown,
        })
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn sealer(&self) -> &Sealer {
        &self.sealer
    }

    /// Seal one detector event and publish it.
    pub async fn ingest(&self, event: &DetectorEvent) -> Result<PublishOutcome, PublishError> {
        let envelope = self.sealer.seal(event)?;
        self.publisher.publish(&envelope).await
    }

    /// Read JSON-lines detector events until EOF or shutdown.
    pub async fn collect<R>(&self, reader: R) -> Result<CollectSummary, AgentError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = CollectSummary::default();
        let mut lines = reader.lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.shutdown.cancelled() => break,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event: DetectorEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("skipping malformed detector event: {}", e);
                    summary.malformed += 1;
                    continue;
                }
            };
            summary.events += 1;

            match self.ingest(&event).await {
                Ok(PublishOutcome::Delivered) => summary.delivered += 1,
                Ok(PublishOutcome::Queued) => summary.queued += 1,
                Ok(PublishOutcome::Dropped(_)) => summary.dropped += 1,
                Err(PublishError::ShuttingDown) => break,
                Err(e) => {
                    tracing::error!("publish failed: {}", e);
                    summary.dropped += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Run until shutdown: drain loop, HTTP endpoints and stdin collection.
    ///
    /// EOF on stdin does not stop the agent; the drain loop keeps replaying
    /// the backlog until shutdown.
    pub async fn run(self) -> Result<(), AgentError> {
        tracing::info!(
            "agent {} on {} publishing to {}",
            self.config.agent_id,
            self.config.host,
            self.config.broker_address
        );

        let drain = DrainLoop::new(
            self.publisher.clone(),
            self.config.drain_batch,
            self.config.drain_idle(),
            self.shutdown.clone(),
        );
        let drain_task = tokio::spawn(drain.run());

        let http_task = {
            let bind = self.config.health_bind.clone();
            let health_port = self.config.health_port;
            let metrics_port = self.config.metrics_port;
            let state = self.health.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = health::serve(&bind, health_port, metrics_port, state, shutdown).await
                {
                    tracing::error!("health server failed: {}", e);
                }
            })
        };

        let summary = self.collect(BufReader::new(tokio::io::stdin())).await?;
        tracing::info!(
            "collection finished: events={} delivered={} queued={} dropped={} malformed={}",
            summary.events,
            summary.delivered,
            summary.queued,
            summary.dropped,
            summary.malformed
        );

        self.shutdown.cancelled().await;
        let _ = drain_task.await;
        let _ = http_task.await;

        let stats = self.publisher.queue().stats();
        tracing::info!(
            "agent stopped ({} envelopes still queued, {} bytes)",
            stats.depth,
            stats.backlog_bytes
        );
        Ok(())
    }
}
