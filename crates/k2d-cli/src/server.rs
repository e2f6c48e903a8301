//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use k2d_core::health::{HealthCheck, HealthStatus};
use k2d_core::metrics::IngestionMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<IngestionMetrics>,
}

/// Serve `/health`, `/healthz` and `/readyz` on `health_port` and `/metrics`
/// on `metrics_port` until shutdown.
pub async fn start_server(
    state: Arc<ServerState>,
    health_port: u16,
    metrics_port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let health_addr = SocketAddr::from(([0, 0, 0, 0], health_port));
    let health_listener = match tokio::net::TcpListener::bind(health_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = health_port, "Failed to bind health server");
            return;
        }
    };
    info!(port = health_port, "Health server started");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    let metrics_listener = match tokio::net::TcpListener::bind(metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = metrics_port, "Failed to bind metrics server");
            return;
        }
    };
    info!(port = metrics_port, "Metrics server started");

    let health_server = async {
        axum::serve(health_listener, health_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Health server error"))
    };

    let metrics_server = async {
        axum::serve(metrics_listener, metrics_router(Arc::clone(&state)))
            .await
            .map_err(|e| error!(error = %e, "Metrics server error"))
    };

    tokio::select! {
        _ = health_server => {}
        _ = metrics_server => {}
        _ = shutdown_rx.recv() => {
            info!("HTTP servers shutting down");
        }
    }
}

fn health_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn status_code(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let report = state.health.report();
    let code = status_code(report.status != HealthStatus::Unhealthy);
    (code, Json(report))
}

/// Kubernetes liveness check handler.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    status_code(state.health.is_alive())
}

/// Kubernetes readiness check handler.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    status_code(state.health.is_ready())
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2d_core::health::{COMPONENT_DELTA, COMPONENT_KAFKA};

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            health: Arc::new(HealthCheck::for_query()),
            metrics: Arc::new(IngestionMetrics::new()),
        })
    }

    #[tokio::test]
    async fn test_readiness_follows_query() {
        let state = state();
        let response = readyz_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.health.job_started();
        let response = readyz_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_unavailable_when_unhealthy() {
        let state = state();
        state.health.mark_degraded(COMPONENT_KAFKA, "data loss");
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.health.mark_unhealthy(COMPONENT_DELTA, "commit failed");
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = healthz_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let response = metrics_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
