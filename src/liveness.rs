// Liveness HTTP endpoint for hosting platforms, plus Prometheus scraping.

use axum::{http::header, response::IntoResponse, routing::get, Router};
use tokio_util::sync::CancellationToken;

use crate::metrics;

async fn ok() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

pub fn router() -> Router {
    Router::new()
        .route("/", get(ok))
        .route("/health", get(ok))
        .route("/metrics", get(metrics_handler))
}

/// Serve the liveness router on `0.0.0.0:port` until `shutdown` is cancelled.
///
/// Bind failures are logged and the function returns; the session engine
/// does not depend on this server.
pub async fn serve(port: u16, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind liveness server to port {}: {}", port, e);
            return;
        }
    };

    tracing::info!("Liveness server listening on port {}", port);
    if let Err(e) = axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!("Liveness server error: {}", e);
    }
}
