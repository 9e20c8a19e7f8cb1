//! Operational HTTP endpoints
//!
//! - `GET /metrics` - Prometheus text exposition of the engine's registry
//! - `GET /health` - halt state and audit chain length

use crate::{engine::LedgerEngine, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `halted` while commits are refused
    pub status: &'static str,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Audit entries appended so far
    pub audit_entries: u64,
}

/// Router exposing the operational endpoints
pub fn router(engine: Arc<LedgerEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(engine)
}

/// Serve the operational endpoints until the listener fails
pub async fn serve(engine: Arc<LedgerEngine>, listener: tokio::net::TcpListener) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr()?, "Metrics endpoint listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

async fn health_check(State(engine): State<Arc<LedgerEngine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if engine.is_halted() { "halted" } else { "healthy" },
        service: engine.config().service_name.clone(),
        version: engine.config().service_version.clone(),
        audit_entries: engine.audit().len(),
    })
}

async fn metrics_handler(State(engine): State<Arc<LedgerEngine>>) -> String {
    engine.metrics().render()
}
