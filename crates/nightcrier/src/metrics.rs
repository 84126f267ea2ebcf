use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::incident::IncidentStatus;

/// Pipeline counters, surfaced in the health summary.
#[derive(Clone)]
pub struct PipelineMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Events received from the fan-in channel
    events_received: AtomicU64,

    /// Events dropped before incident creation (permissions / triage off)
    events_dropped: AtomicU64,

    /// Incidents created (lifetime)
    incidents_created: AtomicU64,

    incidents_succeeded: AtomicU64,
    incidents_failed: AtomicU64,
    incidents_agent_failed: AtomicU64,
    incidents_timed_out: AtomicU64,
    incidents_expired: AtomicU64,

    /// Notifications handed to the webhook (per-incident + breaker)
    notifications_sent: AtomicU64,

    storage_uploads: AtomicU64,
    storage_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_dropped: u64,
    pub incidents_created: u64,
    pub incidents_succeeded: u64,
    pub incidents_failed: u64,
    pub incidents_agent_failed: u64,
    pub incidents_timed_out: u64,
    pub incidents_expired: u64,
    pub notifications_sent: u64,
    pub storage_uploads: u64,
    pub storage_failures: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                events_received: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
                incidents_created: AtomicU64::new(0),
                incidents_succeeded: AtomicU64::new(0),
                incidents_failed: AtomicU64::new(0),
                incidents_agent_failed: AtomicU64::new(0),
                incidents_timed_out: AtomicU64::new(0),
                incidents_expired: AtomicU64::new(0),
                notifications_sent: AtomicU64::new(0),
                storage_uploads: AtomicU64::new(0),
                storage_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn event_received(&self) {
        self.inner.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.inner.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incident_created(&self) {
        self.inner.incidents_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed incident by its final status. Queue-expired
    /// incidents are recorded through `incident_expired` instead so the
    /// failed counter keeps meaning "ran and failed".
    pub fn incident_completed(&self, status: IncidentStatus) {
        let counter = match status {
            IncidentStatus::Success => &self.inner.incidents_succeeded,
            IncidentStatus::Failed => &self.inner.incidents_failed,
            IncidentStatus::AgentFailed => &self.inner.incidents_agent_failed,
            IncidentStatus::Timeout => &self.inner.incidents_timed_out,
            IncidentStatus::Pending | IncidentStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incident_expired(&self) {
        self.inner.incidents_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.inner.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_upload(&self) {
        self.inner.storage_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_failure(&self) {
        self.inner.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.inner;
        MetricsSnapshot {
            events_received: m.events_received.load(Ordering::Relaxed),
            events_dropped: m.events_dropped.load(Ordering::Relaxed),
            incidents_created: m.incidents_created.load(Ordering::Relaxed),
            incidents_succeeded: m.incidents_succeeded.load(Ordering::Relaxed),
            incidents_failed: m.incidents_failed.load(Ordering::Relaxed),
            incidents_agent_failed: m.incidents_agent_failed.load(Ordering::Relaxed),
            incidents_timed_out: m.incidents_timed_out.load(Ordering::Relaxed),
            incidents_expired: m.incidents_expired.load(Ordering::Relaxed),
            notifications_sent: m.notifications_sent.load(Ordering::Relaxed),
            storage_uploads: m.storage_uploads.load(Ordering::Relaxed),
            storage_failures: m.storage_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_counters_by_status() {
        let metrics = PipelineMetrics::new();
        metrics.incident_completed(IncidentStatus::Success);
        metrics.incident_completed(IncidentStatus::AgentFailed);
        metrics.incident_completed(IncidentStatus::AgentFailed);
        metrics.incident_completed(IncidentStatus::Timeout);
        metrics.incident_completed(IncidentStatus::Pending);

        let snap = metrics.snapshot();
        assert_eq!(snap.incidents_succeeded, 1);
        assert_eq!(snap.incidents_agent_failed, 2);
        assert_eq!(snap.incidents_timed_out, 1);
        assert_eq!(snap.incidents_failed, 0);
    }

    #[test]
    fn test_snapshot_reflects_counts() {
        let metrics = PipelineMetrics::new();
        metrics.event_received();
        metrics.event_received();
        metrics.event_dropped();
        metrics.incident_created();
        metrics.incident_expired();
        metrics.storage_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.events_dropped, 1);
        assert_eq!(snap.incidents_created, 1);
        assert_eq!(snap.incidents_expired, 1);
        assert_eq!(snap.storage_failures, 1);
    }
}
