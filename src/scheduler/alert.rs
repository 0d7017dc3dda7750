//! Notification about failed scheduled backups.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

use crate::backup::Tier;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed scheduled backup. Sent once and never persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub tier: Tier,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Host the scheduler runs on.
    pub server: String,
}

impl AlertEvent {
    pub fn backup_failed(tier: Tier, error: &dyn std::error::Error) -> Self {
        Self {
            tier,
            error: error.to_string(),
            timestamp: Utc::now(),
            server: server_identity(),
        }
    }

    /// One line summary for chat style webhooks.
    pub fn summary(&self) -> String {
        format!(
            "{} backup failed on {} at {}: {}",
            self.tier,
            self.server,
            self.timestamp.to_rfc3339(),
            self.error
        )
    }
}

#[derive(Debug, Display, Error, From)]
pub enum AlertError {
    #[display("Sending alert failed: {_0}")]
    Http(reqwest::Error),
    #[display("Alert receiver answered with {_0}")]
    #[from(ignore)]
    Status(#[error(ignore)] reqwest::StatusCode),
}

/// Receiver of [AlertEvent]s.
pub trait AlertSink: Send + Sync {
    fn send(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Posts [AlertEvent]s as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[derive(serde::Serialize)]
struct WebhookPayload<'a> {
    text: String,
    #[serde(flatten)]
    event: &'a AlertEvent,
}

impl AlertSink for WebhookAlertSink {
    fn send(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let payload = WebhookPayload {
            text: event.summary(),
            event,
        };
        let response = self.client.post(&self.url).json(&payload).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status));
        }
        Ok(())
    }
}

/// Delivers `event` on a detached thread; failures are only logged.
pub fn dispatch(sink: std::sync::Arc<dyn AlertSink>, event: AlertEvent) {
    let spawned = thread::Builder::new()
        .name(format!("alert-{}", event.tier))
        .spawn(move || match sink.send(&event) {
            Ok(()) => log::info!(target: "scheduler::alert", "Failure alert for {} backup sent", event.tier),
            Err(e) => log::warn!(target: "scheduler::alert", "Failure alert for {} backup not delivered: {e}", event.tier),
        });

    if let Err(e) = spawned {
        log::warn!(target: "scheduler::alert", "Unable to start alert delivery: {e}");
    }
}

/// Name of this host for alerts.
pub fn server_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn payload_carries_summary_and_fields() {
        let error = io::Error::other("disk full");
        let event = AlertEvent::backup_failed(Tier::Daily, &error);
        let payload = WebhookPayload {
            text: event.summary(),
            event: &event,
        };

        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "daily");
        assert_eq!(json["error"], "disk full");
        assert_eq!(json["server"], event.server.as_str());
        assert!(json["text"].as_str().unwrap().contains("daily backup failed"));
    }

    #[test]
    fn unreachable_webhook_is_an_error() {
        // nothing listens on the discard port
        let sink = WebhookAlertSink::new("http://127.0.0.1:9/hook").unwrap();
        let event = AlertEvent::backup_failed(Tier::Weekly, &io::Error::other("boom"));

        assert!(matches!(sink.send(&event), Err(AlertError::Http(_))));
    }
}
