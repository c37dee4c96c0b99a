use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use super::Server;
use crate::metrics::{gather_metrics, ALERTS_RECEIVED_TOTAL};
use crate::sources::AlertManagerWebhook;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> String {
    gather_metrics()
}

pub async fn alertmanager_webhook(
    State(server): State<Arc<Server>>,
    Json(payload): Json<AlertManagerWebhook>,
) -> Response {
    info!(
        receiver = %payload.receiver,
        alerts = payload.alerts.len(),
        "Received AlertManager webhook"
    );

    let alerts = match payload.into_alerts() {
        Ok(alerts) => alerts,
        Err(e) => {
            error!("Failed to convert AlertManager payload: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let accepted = alerts.len();
    for alert in alerts {
        if server.alerts.send(alert).await.is_err() {
            error!("Alert queue is closed, rejecting webhook");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "alert queue is closed" })),
            )
                .into_response();
        }
        ALERTS_RECEIVED_TOTAL.with_label_values(&["alertmanager"]).inc();
    }

    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}
