//! Admin surface: `/health` and `/metrics` over plain HTTP
//!
//! Serves read-only aggregates from the tenant registry and port pool for
//! external supervision. Never speaks TLS and never mutates relay state.

use axum::{extract::State, routing::get, Json, Router};
use link_control::{PortPool, TenantRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared read-only state for the admin endpoints
pub struct AdminState {
    pub registry: Arc<TenantRegistry>,
    pub pool: Arc<PortPool>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the admin endpoints on an already-bound listener
pub async fn serve(listener: TcpListener, state: Arc<AdminState>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health check server listening on {}", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn health(State(state): State<Arc<AdminState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeTenants": state.registry.count(),
        "availablePorts": state.pool.free_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let tenants = state.registry.snapshot_metrics();
    let total_connections: usize = tenants.iter().map(|t| t.active_conns).sum();

    Json(json!({
        "activeTenants": tenants.len(),
        "availablePorts": state.pool.free_count(),
        "totalConnections": total_connections,
        "tenants": tenants,
    }))
}
