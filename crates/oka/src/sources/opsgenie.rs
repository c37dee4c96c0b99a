//! Polls the OpsGenie Alert API for open alerts.
//!
//! Every interval the templated query is run against `/v2/alerts`, and each
//! alert that is neither acknowledged nor already dispatched by this process
//! is fetched in full and pushed onto the alert queue.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::OpsGenieConfig;
use crate::metrics::ALERTS_RECEIVED_TOTAL;
use crate::template::render_go_template;
use crate::{Error, Result};

/// Page size enforced by the OpsGenie API.
const MAX_ALERTS_PER_REQUEST: usize = 100;
/// Upper bound on `offset + limit` accepted by the OpsGenie API.
const MAX_TOTAL_ALERTS: usize = 20000;

/// Entry of an alert listing. Only the fields needed for filtering are kept.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AlertSummary {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Debug, Deserialize)]
struct ListAlertsResponse {
    #[serde(default)]
    data: Vec<AlertSummary>,
}

#[derive(Debug, Deserialize)]
struct GetAlertResponse {
    data: Value,
}

pub struct OpsGenieClient {
    http: reqwest::Client,
    api_url: Url,
    api_key: String,
}

impl OpsGenieClient {
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let api_url = Url::parse(api_url)
            .map_err(|e| Error::Config(format!("invalid OpsGenie API URL {}: {}", api_url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url,
            api_key: api_key.into(),
        })
    }

    /// Build a client whose API key is read from `config.env_var`.
    pub fn from_config(config: &OpsGenieConfig) -> Result<Self> {
        let api_key = std::env::var(&config.env_var).unwrap_or_default();
        if api_key.is_empty() {
            warn!(env_var = %config.env_var, "OpsGenie API key is not set");
        }
        Self::new(&config.api_url, api_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid OpsGenie endpoint {}: {}", path, e)))
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("Authorization", format!("GenieKey {}", self.api_key))
    }

    /// List every alert matching `query`, newest first.
    pub async fn list_alerts(&self, query: &str) -> Result<Vec<AlertSummary>> {
        let url = self.endpoint("/v2/alerts")?;
        let mut alerts = Vec::new();
        let mut offset = 0;

        while offset < MAX_TOTAL_ALERTS {
            debug!(query, offset, "Fetching alerts");
            let page: ListAlertsResponse = self
                .get(url.clone())
                .query(&[
                    ("query", query.to_string()),
                    ("offset", offset.to_string()),
                    ("limit", MAX_ALERTS_PER_REQUEST.to_string()),
                    ("sort", "createdAt".to_string()),
                    ("order", "desc".to_string()),
                ])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if page.data.is_empty() {
                break;
            }
            alerts.extend(page.data);
            offset += MAX_ALERTS_PER_REQUEST;
        }

        debug!(count = alerts.len(), "Fetched alerts");
        Ok(alerts)
    }

    /// Fetch the full alert document.
    pub async fn get_alert(&self, id: &str) -> Result<Value> {
        let url = self.endpoint(&format!("/v2/alerts/{}", id))?;
        let response: GetAlertResponse = self
            .get(url)
            .query(&[("identifierType", "id")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.data)
    }
}

/// Render the configured query with the team name and today's date
/// (midnight UTC, `dd-mm-yyyyT00:00:00`).
pub fn template_query(query_string: &str, team: &str) -> Result<String> {
    if query_string.is_empty() {
        return Err(Error::Config("OpsGenie query string cannot be empty".to_string()));
    }
    if team.is_empty() {
        return Err(Error::Config("OpsGenie team cannot be empty".to_string()));
    }

    let today = Utc::now().date_naive().format("%d-%m-%YT00:00:00").to_string();
    render_go_template(query_string, &json!({ "Team": team, "Today": today }))
}

/// Periodic poller feeding the alert queue.
pub struct OpsGenieSource {
    client: OpsGenieClient,
    query: String,
    interval: Duration,
    dispatched: HashSet<String>,
}

impl OpsGenieSource {
    pub fn new(config: &OpsGenieConfig) -> Result<Self> {
        Ok(Self::with_client(
            OpsGenieClient::from_config(config)?,
            template_query(&config.query_string, &config.team)?,
            Duration::from_secs(config.interval_seconds.max(1)),
        ))
    }

    pub fn with_client(client: OpsGenieClient, query: String, interval: Duration) -> Self {
        Self {
            client,
            query,
            interval,
            dispatched: HashSet::new(),
        }
    }

    /// Run one listing and push every new alert. Returns how many were sent.
    pub async fn poll_once(&mut self, alerts: &mpsc::Sender<Value>) -> Result<usize> {
        let listed = self.client.list_alerts(&self.query).await?;
        let total = listed.len();
        let listed_ids: HashSet<String> = listed.iter().map(|alert| alert.id.clone()).collect();
        let mut sent = 0;

        for summary in listed {
            if summary.acknowledged || self.dispatched.contains(&summary.id) {
                continue;
            }

            let alert = match self.client.get_alert(&summary.id).await {
                Ok(alert) => alert,
                Err(e) => {
                    warn!(id = %summary.id, "Failed to get alert from OpsGenie: {}", e);
                    continue;
                }
            };

            if alerts.send(alert).await.is_err() {
                return Err(Error::Internal("alert queue closed".to_string()));
            }
            ALERTS_RECEIVED_TOTAL.with_label_values(&["opsgenie"]).inc();
            self.dispatched.insert(summary.id);
            sent += 1;
        }

        // Alerts no longer listed were closed; forget them
        self.dispatched.retain(|id| listed_ids.contains(id));

        info!(new = sent, total, "Fetched alerts from OpsGenie");
        Ok(sent)
    }

    pub async fn run(mut self, alerts: mpsc::Sender<Value>, cancel: CancellationToken) {
        info!(interval = ?self.interval, query = %self.query, "OpsGenie source started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&alerts).await {
                        error!("Failed to fetch alerts from OpsGenie: {}", e);
                        if alerts.is_closed() {
                            break;
                        }
                    }
                }
            }
        }
        info!("OpsGenie source stopped");
    }
}
