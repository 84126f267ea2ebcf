use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::NotifierConfig;
use crate::incident::Incident;

use super::breaker::{DegradedAlert, RecoveredAlert};

/// Notification payloads. The webhook receives the structured form plus
/// a rendered `text` field; what the chat side does with it is its own
/// business.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Incident {
        incident_id: String,
        cluster: String,
        status: String,
        severity: String,
        fault_type: String,
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        investigation_excerpt: Option<String>,
    },
    Degraded {
        failure_count: u32,
        first_failure_at: DateTime<Utc>,
        sample_reasons: Vec<String>,
    },
    Recovered {
        downtime_seconds: u64,
        total_failures: u32,
    },
}

const EXCERPT_LIMIT: usize = 600;

impl Notification {
    pub fn for_incident(incident: &Incident, investigation: Option<&str>) -> Self {
        let resource = match &incident.resource.namespace {
            Some(ns) => format!("{}/{} ({})", incident.resource.kind, incident.resource.name, ns),
            None => format!("{}/{}", incident.resource.kind, incident.resource.name),
        };
        Notification::Incident {
            incident_id: incident.incident_id.to_string(),
            cluster: incident.cluster.clone(),
            status: incident.status.as_str().to_string(),
            severity: incident.severity.as_str().to_string(),
            fault_type: incident.fault_type.clone(),
            resource,
            failure_reason: incident.failure_reason.clone(),
            investigation_excerpt: investigation.map(excerpt),
        }
    }

    pub fn degraded(alert: &DegradedAlert) -> Self {
        Notification::Degraded {
            failure_count: alert.failure_count,
            first_failure_at: alert.first_failure_at,
            sample_reasons: alert.sample_reasons.clone(),
        }
    }

    pub fn recovered(alert: &RecoveredAlert) -> Self {
        Notification::Recovered {
            downtime_seconds: alert.downtime_seconds,
            total_failures: alert.total_failures,
        }
    }

    fn render_text(&self) -> String {
        match self {
            Notification::Incident {
                cluster,
                status,
                severity,
                fault_type,
                resource,
                failure_reason,
                ..
            } => {
                let mut text =
                    format!("[{cluster}] {severity} {fault_type} on {resource}: triage {status}");
                if let Some(reason) = failure_reason {
                    text.push_str(&format!(" ({reason})"));
                }
                text
            }
            Notification::Degraded {
                failure_count,
                first_failure_at,
                sample_reasons,
            } => format!(
                "Triage system degraded: {failure_count} consecutive agent failures since {} — sample reasons: {}",
                first_failure_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                sample_reasons.join("; "),
            ),
            Notification::Recovered {
                downtime_seconds,
                total_failures,
            } => format!(
                "Triage system recovered after {downtime_seconds}s ({total_failures} failures in the window)"
            ),
        }
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= EXCERPT_LIMIT {
        return trimmed.to_string();
    }
    let mut end = EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

/// Delivery seam. The production sink is the webhook; tests substitute
/// recording fakes.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Returns whether a message was actually dispatched (a configured
    /// no-op sink returns `Ok(false)`).
    async fn notify(&self, notification: Notification) -> anyhow::Result<bool>;
}

/// Posts JSON to the configured chat webhook. With no webhook configured
/// every notification is a no-op. Delivery is best-effort; callers log
/// failures and move on.
#[derive(Debug)]
pub struct WebhookNotifier {
    webhook: Option<Url>,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> anyhow::Result<Self> {
        let webhook = config
            .webhook_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid notifier.webhook_url: {e}"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { webhook, http })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: String,
    #[serde(flatten)]
    notification: &'a Notification,
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<bool> {
        let Some(webhook) = &self.webhook else {
            return Ok(false);
        };

        let payload = WebhookPayload {
            text: notification.render_text(),
            notification: &notification,
        };

        let response = self.http.post(webhook.clone()).json(&payload).send().await?;
        response.error_for_status()?;
        Ok(true)
    }
}
