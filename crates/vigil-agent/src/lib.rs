// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil agent
//!
//! Turns detector events into signed envelopes and delivers them to the
//! broker. Anything that cannot be delivered right now lands in the durable
//! SQLite queue and is replayed by a background drain loop.
//!
//! # Architecture
//!
//! ```text
//! stdin (JSON lines)
//!        |
//!        v
//!   DetectorEvent --Sealer--> Envelope --Publisher--> BrokerClient --> broker
//!                                           |   ^
//!                               RETRY / I/O |   | DrainLoop
//!                                           v   |
//!                                        DurableQueue
//! ```
//!
//! `/healthz`, `/readyz` and `/metrics` are served over HTTP alongside.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod drain;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod rate;
pub mod transport;

pub use agent::{Agent, AgentError};
pub use backoff::{jitter, Backoff, BackoffConfig};
pub use config::{AgentConfig, ConfigError};
pub use drain::DrainLoop;
pub use health::HealthState;
pub use metrics::{AgentMetrics, MetricsError};
pub use publisher::{DropReason, PublishError, PublishOutcome, Publisher, PublisherConfig};
pub use rate::{Acquire, RateLimiter};
pub use transport::{BrokerClient, Transport, TransportError};

#[cfg(test)]
pub(crate) mod testing {
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use vigil::{Envelope, Payload, PayloadKind, PublishAck};

    /// Signed-looking envelope with `size` payload bytes.
    pub fn envelope(key: &str, size: usize) -> Envelope {
        let mut env = Envelope::new(
            1_700_000_000_000_000_000,
            key,
            Payload {
                kind: PayloadKind::Telemetry,
                data: vec![0x5a; size],
            },
        );
        env.signature = vec![7; 64];
        env
    }

    /// Replays scripted replies, then acknowledges everything.
    #[derive(Default)]
    pub struct StubTransport {
        script: Mutex<VecDeque<Result<PublishAck, TransportError>>>,
        sent: Mutex<Vec<String>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl StubTransport {
        pub fn scripted(replies: Vec<Result<PublishAck, TransportError>>) -> Self {
            Self {
                script: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Keys the stub answered OK, in order.
        pub fn sent_keys(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn publish(&self, envelope: &Envelope) -> Result<PublishAck, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(PublishAck::ok("accepted")));
            if matches!(&reply, Ok(ack) if ack.status == vigil::AckStatus::Ok) {
                self.sent.lock().push(envelope.idempotency_key.clone());
            }
            reply
        }
    }
}
