// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker TCP server.
//!
//! One task per connection, tracked in a `JoinSet`. Each connection reads a
//! publish frame, runs it through the [`PublishHandler`] and writes back the
//! ack. On shutdown the listener closes first, then connection tasks finish
//! the request they hold and exit.

use crate::admission::{AdmissionConfig, AdmissionController};
use crate::config::{BrokerConfig, ConfigError};
use crate::handler::{HandlerConfig, PublishHandler};
use crate::sink::{EnvelopeSink, JsonlSink, SinkError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use vigil::tls::TlsAcceptor;
use vigil::{Frame, FramedStream, PublishAck, Shutdown, TlsConfig, TlsError, WireError};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept()` (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// The broker.
pub struct BrokerServer {
    config: BrokerConfig,
    handler: Arc<PublishHandler>,
    tls: Option<TlsConfig>,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("listen", &self.config.listen_addr())
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl BrokerServer {
    /// Build from configuration, appending accepted envelopes to `sink_path`.
    pub fn new(config: BrokerConfig) -> Result<Self, ServerError> {
        let sink = Arc::new(JsonlSink::open(&config.sink_path)?);
        tracing::info!("storing accepted envelopes in {}", config.sink_path.display());
        Self::with_sink(config, sink)
    }

    /// Build with an explicit sink.
    pub fn with_sink(config: BrokerConfig, sink: Arc<dyn EnvelopeSink>) -> Result<Self, ServerError> {
        config.validate()?;

        let tls = if config.tls {
            Some(TlsConfig::from_cert_dir(&config.cert_dir, "broker")?)
        } else {
            None
        };

        let admission = Arc::new(AdmissionController::new(AdmissionConfig {
            max_inflight: config.max_inflight,
            hard_max: config.hard_max,
            backoff_min_ms: config.backoff_min_ms,
            backoff_max_ms: config.backoff_max_ms,
            overload: config.overload,
        }));
        let handler = Arc::new(PublishHandler::new(
            admission,
            sink,
            HandlerConfig {
                trusted_keys: config.trusted_key_bytes()?,
                max_envelope_age: config.max_envelope_age(),
                dedup_capacity: config.dedup_capacity,
            },
        ));

        Ok(Self {
            config,
            handler,
            tls,
        })
    }

    /// Replace the TLS material loaded from `cert_dir`.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn handler(&self) -> &Arc<PublishHandler> {
        &self.handler
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ServerError> {
        tracing::info!(
            "broker listening on {} ({})",
            listener.local_addr()?,
            if self.tls.is_some() { "mTLS" } else { "plaintext" }
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!("connection from {}", peer);
                            let handler = self.handler.clone();
                            let tls = self.tls.as_ref().map(TlsConfig::acceptor);
                            let max = self.config.max_message_size;
                            let shutdown = shutdown.clone();
                            tasks.spawn(async move {
                                if let Err(e) = accept_connection(stream, peer, tls, handler, max, shutdown).await {
                                    tracing::warn!("connection {} closed with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            if !pause_after_accept_error(&e, &shutdown).await {
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
            while tasks.try_join_next().is_some() {}
        }

        drop(listener);
        tracing::info!("shutdown: waiting for {} connection(s)", tasks.len());
        while tasks.join_next().await.is_some() {}

        let stats = self.handler.stats();
        tracing::info!(
            "broker stopped (accepted={} duplicates={} invalid={} retried={} bad_signature={} too_old={})",
            stats.accepted,
            stats.duplicates,
            stats.invalid,
            stats.retried,
            stats.bad_signature,
            stats.too_old
        );
        Ok(())
    }
}

/// Log a failed accept and wait before the next one. False on shutdown.
async fn pause_after_accept_error(err: &std::io::Error, shutdown: &Shutdown) -> bool {
    tracing::error!("accept error: {}; retrying in {:?}", err, ACCEPT_ERROR_BACKOFF);
    shutdown.sleep(ACCEPT_ERROR_BACKOFF).await
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<PublishHandler>,
    max_frame_size: usize,
    shutdown: Shutdown,
) -> Result<(), WireError> {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => {
            let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!("TLS handshake with {} failed: {}", peer, e);
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!("TLS handshake with {} timed out", peer);
                    return Ok(());
                }
            };
            serve_connection(stream, peer, handler, max_frame_size, shutdown).await
        }
        None => serve_connection(stream, peer, handler, max_frame_size, shutdown).await,
    }
}

/// Request/ack loop for one connection.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    handler: Arc<PublishHandler>,
    max_frame_size: usize,
    shutdown: Shutdown,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = FramedStream::new(stream, max_frame_size);
    loop {
        let frame = tokio::select! {
            frame = conn.read_frame() => frame,
            _ = shutdown.cancelled() => break,
        };

        let ack = match frame {
            Ok(Some(Frame::Publish(envelope))) => handler.handle_publish(&envelope).await,
            Ok(Some(Frame::Ack(_))) => {
                tracing::warn!("{} sent an ack frame; closing", peer);
                break;
            }
            Ok(None) => {
                tracing::debug!("connection closed: {}", peer);
                break;
            }
            // The body was consumed, so the stream is still in sync.
            Err(WireError::Malformed(e)) => PublishAck::invalid(format!("malformed envelope: {e}")),
            Err(e) => return Err(e),
        };
        conn.write_frame(&Frame::Ack(ack)).await?;
    }
    let _ = conn.shutdown().await;
    Ok(())
}
