// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent -> broker transport.
//!
//! [`BrokerClient`] keeps one lazily (re)established connection, plain TCP
//! or mutual TLS, and performs one publish/ack round trip per call. Any
//! failure discards the connection so the next call reconnects.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use vigil::tls::ServerName;
use vigil::{Envelope, Frame, FramedStream, PublishAck, TlsConfig, WireError};

/// Transport-level failures. Always transient from the publisher's view.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker closed the connection")]
    Closed,

    #[error("unexpected frame from broker")]
    UnexpectedFrame,

    #[error("{0}")]
    Other(String),
}

/// Something that can deliver one envelope and return the broker's verdict.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<PublishAck, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn publish(&self, envelope: &Envelope) -> Result<PublishAck, TransportError> {
        (**self).publish(envelope).await
    }
}

trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

type Connection = FramedStream<Box<dyn ByteStream>>;

/// TCP/TLS client for the broker.
pub struct BrokerClient {
    address: String,
    tls: Option<(TlsConfig, ServerName<'static>)>,
    timeout: Duration,
    max_frame_size: usize,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl BrokerClient {
    /// Plain TCP client.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            tls: None,
            timeout,
            max_frame_size: vigil::DEFAULT_MAX_FRAME_SIZE,
            conn: Mutex::new(None),
        }
    }

    /// Mutual TLS client verifying the broker as `server_name`.
    pub fn with_tls(
        address: impl Into<String>,
        timeout: Duration,
        tls: TlsConfig,
        server_name: &str,
    ) -> Result<Self, vigil::TlsError> {
        let name = vigil::server_name(server_name)?;
        let mut client = Self::new(address, timeout);
        client.tls = Some((tls, name));
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.address.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let stream: Box<dyn ByteStream> = match &self.tls {
            Some((tls, name)) => {
                let stream = tls
                    .connector()
                    .connect(name.clone(), tcp)
                    .await
                    .map_err(TransportError::Tls)?;
                Box::new(stream)
            }
            None => Box::new(tcp),
        };
        tracing::debug!("connected to broker at {}", self.address);
        Ok(FramedStream::new(stream, self.max_frame_size))
    }

    async fn round_trip(
        &self,
        slot: &mut Option<Connection>,
        envelope: &Envelope,
    ) -> Result<PublishAck, TransportError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let conn = slot.as_mut().ok_or(TransportError::Closed)?;

        conn.write_frame(&Frame::Publish(envelope.clone())).await?;
        match conn.read_frame().await? {
            Some(Frame::Ack(ack)) => Ok(ack),
            Some(Frame::Publish(_)) => Err(TransportError::UnexpectedFrame),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Transport for BrokerClient {
    async fn publish(&self, envelope: &Envelope) -> Result<PublishAck, TransportError> {
        let mut slot = self.conn.lock().await;
        let result = match tokio::time::timeout(self.timeout, self.round_trip(&mut slot, envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }
}
