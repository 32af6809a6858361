// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent-side delivery against a live broker: direct publish, queue
//! buffering and replay.

mod common;

use common::{loopback_config, RunningBroker};
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use vigil::{AckStatus, DetectorEvent, Envelope, EnvelopeSigner, FlowRecord, Sealer, Shutdown};
use vigil_agent::{
    AgentMetrics, BackoffConfig, BrokerClient, DrainLoop, PublishOutcome, Publisher,
    PublisherConfig, Transport,
};
use vigil_broker::{BrokerConfig, BrokerServer, MemorySink};
use vigil_queue::{DurableQueue, QueueConfig};

fn flow(src_port: u16) -> DetectorEvent {
    DetectorEvent::Flow(FlowRecord {
        src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        src_port,
        dst_port: 443,
        protocol: 6,
        bytes: 1200,
        packets: 3,
    })
}

/// An address nothing listens on.
async fn dead_addr() -> std::net::SocketAddr {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    addr
}

#[tokio::test]
async fn test_single_slot_broker_and_buffered_replay() {
    let signer = EnvelopeSigner::from_seed(&[11; 32]);
    let sink = Arc::new(MemorySink::new());
    let config = BrokerConfig {
        max_inflight: 1,
        hard_max: 1,
        trusted_keys: vec![signer.public_key_hex()],
        ..loopback_config()
    };
    let broker = RunningBroker::start(BrokerServer::with_sink(config, sink.clone()).unwrap()).await;

    let sealer = Sealer::new(signer);
    let k1 = sealer.seal(&flow(40_000)).unwrap();

    // The first attempt hits a network failure and is buffered.
    let shutdown = Shutdown::new();
    let queue = Arc::new(DurableQueue::open_in_memory(QueueConfig::default()).unwrap());
    let unreachable: Arc<dyn Transport> = Arc::new(BrokerClient::new(
        dead_addr().await.to_string(),
        Duration::from_millis(500),
    ));
    let publisher = Publisher::new(
        unreachable,
        queue.clone(),
        AgentMetrics::new(Registry::new()).unwrap(),
        PublisherConfig {
            attempt_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        shutdown.clone(),
    );
    assert_eq!(publisher.publish(&k1).await.unwrap(), PublishOutcome::Queued);
    assert_eq!(queue.size(), 1);
    assert_eq!(queue.peek(1).unwrap()[0].idempotency_key, k1.idempotency_key);

    // Network heals: the same envelope is delivered directly.
    let client = BrokerClient::new(broker.addr.to_string(), Duration::from_secs(2));
    let ack = client.publish(&k1).await.unwrap();
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(ack.reason, "accepted");

    // Offering it to the queue again does not insert a second copy.
    assert!(!queue.append(&k1).unwrap());
    assert_eq!(queue.size(), 1);

    // Replaying the buffered copy is harmless: the broker dedups it.
    let client = &client;
    let report = queue
        .drain_report(
            move |envelope: Envelope| async move { client.publish(&envelope).await },
            10,
        )
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert!(queue.is_empty());
    assert_eq!(sink.len(), 1);
    assert_eq!(broker.server.handler().stats().duplicates, 1);

    shutdown.trigger();
    broker.stop().await;
}

#[tokio::test]
async fn test_backlog_drains_once_broker_returns() {
    let signer = EnvelopeSigner::from_seed(&[12; 32]);
    let public_key = signer.public_key_hex();
    let sealer = Sealer::new(signer);

    // Reserve a port, then leave it closed so the agent sees the broker down.
    let addr = dead_addr().await;

    let shutdown = Shutdown::new();
    let queue = Arc::new(DurableQueue::open_in_memory(QueueConfig::default()).unwrap());
    let transport: Arc<dyn Transport> =
        Arc::new(BrokerClient::new(addr.to_string(), Duration::from_millis(500)));
    let publisher = Arc::new(Publisher::new(
        transport,
        queue.clone(),
        AgentMetrics::new(Registry::new()).unwrap(),
        PublisherConfig {
            attempt_timeout: Duration::from_millis(500),
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                cap: Duration::from_millis(100),
            },
            ..Default::default()
        },
        shutdown.clone(),
    ));

    let envelopes: Vec<_> = (0..3)
        .map(|i| sealer.seal(&flow(50_000 + i)).unwrap())
        .collect();
    for env in &envelopes {
        assert_eq!(publisher.publish(env).await.unwrap(), PublishOutcome::Queued);
    }
    assert_eq!(queue.size(), 3);

    // Broker comes up on the same port.
    let sink = Arc::new(MemorySink::new());
    let config = BrokerConfig {
        port: addr.port(),
        trusted_keys: vec![public_key],
        ..loopback_config()
    };
    let broker = RunningBroker::start(BrokerServer::with_sink(config, sink.clone()).unwrap()).await;

    let drain = DrainLoop::new(publisher, 10, Duration::from_millis(20), shutdown.clone());
    let report = drain.run_once().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert!(queue.is_empty());

    let expected: Vec<String> = envelopes.iter().map(|e| e.idempotency_key.clone()).collect();
    assert_eq!(sink.keys(), expected);

    // Chain is intact on the broker side.
    let stored = sink.envelopes();
    assert!(stored[1].follows(&stored[0]));
    assert!(stored[2].follows(&stored[1]));

    shutdown.trigger();
    broker.stop().await;
}
