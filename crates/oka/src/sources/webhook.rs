use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::Result;

// AlertManager webhook payload structures
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertManagerWebhook {
    pub receiver: String,
    pub status: String,
    pub alerts: Vec<AlertManagerAlert>,
    #[serde(rename = "groupLabels")]
    pub group_labels: HashMap<String, String>,
    #[serde(rename = "commonLabels")]
    pub common_labels: HashMap<String, String>,
    #[serde(rename = "commonAnnotations")]
    pub common_annotations: HashMap<String, String>,
    #[serde(rename = "externalURL")]
    pub external_url: String,
    pub version: String,
    #[serde(rename = "groupKey")]
    pub group_key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertManagerAlert {
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(rename = "endsAt")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    pub fingerprint: String,
}

impl AlertManagerAlert {
    pub fn is_firing(&self) -> bool {
        self.status == "firing"
    }

    pub fn name(&self) -> &str {
        self.labels
            .get("alertname")
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

impl AlertManagerWebhook {
    /// Split the group into one payload per firing alert. Resolved alerts
    /// need no investigation and are dropped.
    pub fn into_alerts(self) -> Result<Vec<Value>> {
        let receiver = self.receiver;
        let mut alerts = Vec::with_capacity(self.alerts.len());

        for alert in self.alerts {
            if !alert.is_firing() {
                debug!(alert = alert.name(), status = %alert.status, "Skipping alert");
                continue;
            }
            let mut payload = serde_json::to_value(&alert)?;
            if let Value::Object(fields) = &mut payload {
                fields.insert("receiver".to_string(), Value::String(receiver.clone()));
            }
            alerts.push(payload);
        }

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> AlertManagerWebhook {
        serde_json::from_value(json!({
            "receiver": "oka",
            "status": "firing",
            "alerts": [
                {
                    "status": "firing",
                    "labels": { "alertname": "HighLatency", "severity": "critical" },
                    "annotations": { "summary": "p99 above 2s" },
                    "startsAt": "2024-05-01T10:00:00Z",
                    "endsAt": "0001-01-01T00:00:00Z",
                    "generatorURL": "http://prometheus/graph",
                    "fingerprint": "abc123"
                },
                {
                    "status": "resolved",
                    "labels": { "alertname": "DiskFull" },
                    "fingerprint": "def456"
                }
            ],
            "groupLabels": { "alertname": "HighLatency" },
            "commonLabels": {},
            "commonAnnotations": {},
            "externalURL": "http://alertmanager",
            "version": "4",
            "groupKey": "{}:{alertname=\"HighLatency\"}"
        }))
        .unwrap()
    }

    #[test]
    fn test_only_firing_alerts_are_dispatched() {
        let alerts = payload().into_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["labels"]["alertname"], "HighLatency");
        assert_eq!(alerts[0]["fingerprint"], "abc123");
        assert_eq!(alerts[0]["receiver"], "oka");
    }

    #[test]
    fn test_alert_name_defaults_to_unknown() {
        let alert = AlertManagerAlert::default();
        assert_eq!(alert.name(), "unknown");
        assert!(!alert.is_firing());
    }
}
