use axum::http::StatusCode;
use oka::server::Server;
use serde_json::json;
use tokio::sync::mpsc;

fn webhook_payload() -> serde_json::Value {
    json!({
        "receiver": "oka",
        "status": "firing",
        "alerts": [
            {
                "status": "firing",
                "labels": { "alertname": "HighLatency", "namespace": "api" },
                "annotations": { "summary": "p99 above 2s" },
                "startsAt": "2024-05-01T10:00:00Z",
                "generatorURL": "http://prometheus/graph",
                "fingerprint": "abc123"
            },
            {
                "status": "firing",
                "labels": { "alertname": "PodCrashLooping", "namespace": "api" },
                "annotations": {},
                "startsAt": "2024-05-01T10:01:00Z",
                "generatorURL": "http://prometheus/graph",
                "fingerprint": "def456"
            },
            {
                "status": "resolved",
                "labels": { "alertname": "DiskFull" },
                "annotations": {},
                "startsAt": "2024-05-01T09:00:00Z",
                "endsAt": "2024-05-01T09:30:00Z",
                "generatorURL": "http://prometheus/graph",
                "fingerprint": "ghi789"
            }
        ],
        "groupLabels": { "namespace": "api" },
        "commonLabels": { "namespace": "api" },
        "commonAnnotations": {},
        "externalURL": "http://alertmanager",
        "version": "4",
        "groupKey": "{}:{namespace=\"api\"}"
    })
}

#[tokio::test]
async fn test_server_endpoints() {
    let (tx, mut rx) = mpsc::channel(16);
    let app = Server::new(tx).build_router();
    let client = axum_test::TestServer::new(app).unwrap();

    // Test health endpoint
    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");

    // Test webhook: each firing alert is queued on its own
    let response = client
        .post("/webhook/alertmanager")
        .json(&webhook_payload())
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["accepted"], 2);

    let first = rx.recv().await.unwrap();
    assert_eq!(first["labels"]["alertname"], "HighLatency");
    let second = rx.recv().await.unwrap();
    assert_eq!(second["labels"]["alertname"], "PodCrashLooping");
    assert!(rx.try_recv().is_err());

    // Test metrics endpoint
    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response
        .text()
        .contains("oka_alerts_received_total{source=\"alertmanager\"}"));
}

#[tokio::test]
async fn test_webhook_rejects_invalid_payload() {
    let (tx, _rx) = mpsc::channel(16);
    let client = axum_test::TestServer::new(Server::new(tx).build_router()).unwrap();

    let response = client
        .post("/webhook/alertmanager")
        .json(&json!({ "alerts": "not-a-list" }))
        .await;
    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn test_webhook_with_closed_queue() {
    let (tx, rx) = mpsc::channel(16);
    drop(rx);
    let client = axum_test::TestServer::new(Server::new(tx).build_router()).unwrap();

    let response = client
        .post("/webhook/alertmanager")
        .json(&webhook_payload())
        .await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}
