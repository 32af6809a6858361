// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for broker end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use vigil::{Envelope, Frame, FramedStream, PublishAck, Shutdown};
use vigil_broker::{BrokerConfig, BrokerServer};

/// A broker bound to an ephemeral loopback port.
pub struct RunningBroker {
    pub addr: SocketAddr,
    pub server: Arc<BrokerServer>,
    pub shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl RunningBroker {
    pub async fn start(server: BrokerServer) -> Self {
        let server = Arc::new(server);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();

        let task_server = server.clone();
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            task_server.serve(listener, task_shutdown).await.unwrap();
        });

        Self {
            addr,
            server,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        self.handle.await.unwrap();
    }
}

/// Loopback config on an ephemeral port.
pub fn loopback_config() -> BrokerConfig {
    BrokerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

/// Plain framed connection to the broker.
pub async fn connect(addr: SocketAddr) -> FramedStream<TcpStream> {
    FramedStream::new(TcpStream::connect(addr).await.unwrap(), 1024 * 1024)
}

/// One publish/ack round trip.
pub async fn publish(conn: &mut FramedStream<TcpStream>, envelope: &Envelope) -> PublishAck {
    conn.write_frame(&Frame::Publish(envelope.clone()))
        .await
        .unwrap();
    match conn.read_frame().await.unwrap() {
        Some(Frame::Ack(ack)) => ack,
        other => panic!("expected ack, got {other:?}"),
    }
}
