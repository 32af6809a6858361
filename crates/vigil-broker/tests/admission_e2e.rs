// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Admission control over real TCP connections.
//!
//! A sink that parks inside `store` keeps requests admitted for as long as
//! the test wants, so capacity can be filled deterministically.

mod common;

use async_trait::async_trait;
use common::{connect, loopback_config, publish, RunningBroker};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use vigil::{AckStatus, Envelope, EnvelopeSigner, Payload, PayloadKind};
use vigil_broker::{BrokerConfig, BrokerServer, EnvelopeSink, MemorySink, SinkError};

/// Blocks every `store` until a permit is released.
struct GateSink {
    gate: Semaphore,
    entered: Notify,
    inner: MemorySink,
}

impl GateSink {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            inner: MemorySink::new(),
        }
    }
}

#[async_trait]
impl EnvelopeSink for GateSink {
    async fn store(&self, envelope: &Envelope) -> Result<(), SinkError> {
        self.entered.notify_one();
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.store(envelope).await
    }
}

fn envelope(signer: &EnvelopeSigner, key: &str) -> Envelope {
    let mut env = Envelope::new(
        vigil::now_ns(),
        key,
        Payload {
            kind: PayloadKind::Flow,
            data: br#"{"src_port":1}"#.to_vec(),
        },
    );
    signer.sign_envelope(&mut env).unwrap();
    env
}

#[tokio::test]
async fn test_rejects_at_capacity_without_blocking() {
    let signer = EnvelopeSigner::from_seed(&[5; 32]);
    let sink = Arc::new(GateSink::new());
    let config = BrokerConfig {
        max_inflight: 1,
        hard_max: 1,
        trusted_keys: vec![signer.public_key_hex()],
        ..loopback_config()
    };
    let broker = RunningBroker::start(BrokerServer::with_sink(config, sink.clone()).unwrap()).await;

    // First request is admitted and parks in the sink.
    let held = {
        let addr = broker.addr;
        let env = envelope(&signer, "held");
        tokio::spawn(async move {
            let mut conn = connect(addr).await;
            publish(&mut conn, &env).await
        })
    };
    sink.entered.notified().await;
    assert_eq!(broker.server.handler().admission().inflight(), 1);

    // Second request must bounce immediately.
    let mut conn = connect(broker.addr).await;
    let start = Instant::now();
    let ack = publish(&mut conn, &envelope(&signer, "bounced")).await;
    let elapsed = start.elapsed();

    assert_eq!(ack.status, AckStatus::Retry);
    assert!(
        (100..=1000).contains(&ack.backoff_hint_ms),
        "hint {}",
        ack.backoff_hint_ms
    );
    assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");

    // Release the held request; capacity comes back.
    sink.gate.add_permits(1);
    assert_eq!(held.await.unwrap().status, AckStatus::Ok);
    assert_eq!(broker.server.handler().admission().inflight(), 0);

    sink.gate.add_permits(1);
    let ack = publish(&mut conn, &envelope(&signer, "bounced")).await;
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(sink.inner.keys(), vec!["held", "bounced"]);

    broker.stop().await;
}

#[tokio::test]
async fn test_hard_max_holds_under_concurrent_connections() {
    const CLIENTS: usize = 24;
    let signer = Arc::new(EnvelopeSigner::from_seed(&[6; 32]));
    let sink = Arc::new(GateSink::new());
    let config = BrokerConfig {
        max_inflight: 3,
        hard_max: 3,
        ..loopback_config()
    };
    let broker = RunningBroker::start(BrokerServer::with_sink(config, sink.clone()).unwrap()).await;

    let mut clients = Vec::new();
    for i in 0..CLIENTS {
        let addr = broker.addr;
        let signer = signer.clone();
        clients.push(tokio::spawn(async move {
            let mut conn = connect(addr).await;
            publish(&mut conn, &envelope(&signer, &format!("k{i}"))).await
        }));
    }

    // Everything beyond the ceiling is answered while the admitted three
    // are still parked.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let admission = broker.server.handler().admission();
    assert_eq!(admission.inflight(), 3);
    assert_eq!(admission.stats().rejected, (CLIENTS - 3) as u64);

    sink.gate.add_permits(CLIENTS);
    let mut ok = 0;
    let mut retry = 0;
    for client in clients {
        match client.await.unwrap().status {
            AckStatus::Ok => ok += 1,
            AckStatus::Retry => retry += 1,
            other => panic!("unexpected {other}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(retry, CLIENTS - 3);
    assert_eq!(admission.inflight(), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_overload_drill_over_tcp() {
    let sink = Arc::new(MemorySink::new());
    let config = BrokerConfig {
        overload: true,
        ..loopback_config()
    };
    let broker = RunningBroker::start(BrokerServer::with_sink(config, sink.clone()).unwrap()).await;
    let signer = EnvelopeSigner::from_seed(&[7; 32]);

    let mut conn = connect(broker.addr).await;
    let ack = publish(&mut conn, &envelope(&signer, "k1")).await;
    assert_eq!(ack.status, AckStatus::Retry);
    assert_eq!(ack.reason, "overloaded");

    broker.server.handler().set_overload(false);
    let ack = publish(&mut conn, &envelope(&signer, "k1")).await;
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(sink.len(), 1);

    broker.stop().await;
}
