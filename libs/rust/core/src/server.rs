//! Pull endpoint exposing a [`MetricRegistry`] to scrapers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::MetricRegistry;

/// Handle to the spawned listener task.
pub struct MetricsServer {
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

pub fn router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/", get(metrics_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// Bind `addr` and serve the registry in the background.
///
/// Binding happens before returning so that a port conflict fails startup
/// instead of surfacing later in a detached task.
pub async fn start_metrics_server(registry: Arc<MetricRegistry>, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = ?local_addr, "metrics server listening");
    let app = router(registry);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "metrics server failed");
        }
    });
    Ok(MetricsServer { local_addr, handle })
}

async fn metrics_handler(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match registry.encode_text() {
        Ok(buf) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}
