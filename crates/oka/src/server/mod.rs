mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::Result;

/// HTTP intake for pushed alerts plus health and metrics endpoints.
pub struct Server {
    alerts: mpsc::Sender<Value>,
}

impl Server {
    pub fn new(alerts: mpsc::Sender<Value>) -> Self {
        Self { alerts }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/webhook/alertmanager", post(routes::alertmanager_webhook))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve on `addr` until `cancel` fires.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        info!("Server stopped");
        Ok(())
    }
}
