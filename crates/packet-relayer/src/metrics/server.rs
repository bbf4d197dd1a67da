// Prometheus scrape endpoint
use crate::error::{RelayerError, Result};
use crate::metrics::RelayerMetrics;
use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

async fn metrics_handler(State(metrics): State<RelayerMetrics>) -> impl IntoResponse {
    match metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

pub fn router(metrics: RelayerMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .with_state(metrics)
}

/// Binds the scrape endpoint and serves it in the background.
/// Returns the bound address, which differs from `port` when `port` is 0.
pub async fn spawn_metrics_server(
    host: &str,
    port: u16,
    metrics: RelayerMetrics,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| RelayerError::Config(format!("metrics listener on {}:{}: {}", host, port, e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| RelayerError::Config(format!("metrics listener address: {}", e)))?;
    info!("Metrics server listening on {}", addr);

    let app = router(metrics);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {:?}", e);
        }
    });
    Ok((addr, handle))
}
