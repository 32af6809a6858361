// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Health and metrics HTTP surface.
//!
//! - `GET /healthz` -- liveness, always 200
//! - `GET /readyz`  -- 200 once the queue and transport are up, 503 before
//! - `GET /metrics` -- Prometheus text format

use crate::metrics::AgentMetrics;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tower_http::trace::TraceLayer;
use vigil::Shutdown;
use vigil_queue::DurableQueue;

/// Shared state behind the HTTP handlers.
#[derive(Debug)]
pub struct HealthState {
    metrics: AgentMetrics,
    queue: OnceLock<Arc<DurableQueue>>,
    transport_ready: AtomicBool,
}

impl HealthState {
    pub fn new(metrics: AgentMetrics) -> Self {
        Self {
            metrics,
            queue: OnceLock::new(),
            transport_ready: AtomicBool::new(false),
        }
    }

    /// Queue opened; its gauges are refreshed on every scrape from now on.
    pub fn set_queue(&self, queue: Arc<DurableQueue>) {
        let _ = self.queue.set(queue);
    }

    pub fn set_transport_ready(&self) {
        self.transport_ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.queue.get().is_some() && self.transport_ready.load(Ordering::Acquire)
    }
}

#[derive(Serialize)]
struct Readiness {
    status: &'static str,
    queue: bool,
    transport: bool,
}

/// `/healthz` and `/readyz`
pub fn health_routes() -> Router<Arc<HealthState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// `/metrics`
pub fn metrics_routes() -> Router<Arc<HealthState>> {
    Router::new().route("/metrics", get(metrics))
}

async fn healthz() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    let body = Readiness {
        status: if state.is_ready() { "ready" } else { "not_ready" },
        queue: state.queue.get().is_some(),
        transport: state.transport_ready.load(Ordering::Acquire),
    };
    let code = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    if let Some(queue) = state.queue.get() {
        state.metrics.observe_queue(&queue.stats());
    }
    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve health and metrics until shutdown.
///
/// One listener when both ports match, two otherwise.
pub async fn serve(
    bind: &str,
    health_port: u16,
    metrics_port: u16,
    state: Arc<HealthState>,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    if health_port == metrics_port {
        let app = health_routes()
            .merge(metrics_routes())
            .layer(TraceLayer::new_for_http())
            .with_state(state);
        return serve_one(format!("{bind}:{health_port}"), app, shutdown).await;
    }

    let health = health_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    let metrics = metrics_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    tokio::try_join!(
        serve_one(format!("{bind}:{health_port}"), health, shutdown.clone()),
        serve_one(format!("{bind}:{metrics_port}"), metrics, shutdown),
    )?;
    Ok(())
}

async fn serve_one(addr: String, app: Router, shutdown: Shutdown) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server: http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
