pub mod breaker;
pub mod notify;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::incident::{Incident, IncidentStatus};
use crate::metrics::PipelineMetrics;
use crate::runner::workspace::Workspace;

use breaker::CircuitBreaker;
use notify::{Notification, NotificationSink};
use store::{ArtifactStore, IncidentArtifacts};

/// Knobs governing what the gate does with non-success outcomes.
#[derive(Debug, Clone)]
pub struct ReportPolicy {
    pub notify_on_agent_failure: bool,
    pub upload_failed_investigations: bool,
    pub upload_expired_incidents: bool,
}

/// Decides, per completed incident, whether artifacts are persisted and
/// whether a notification goes out. The local incident record is the
/// source of truth and is written no matter what; everything downstream
/// of it is best-effort.
pub struct ReportingGate {
    policy: ReportPolicy,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn NotificationSink>,
    store: Arc<dyn ArtifactStore>,
    metrics: PipelineMetrics,
    workspace_root: PathBuf,
}

impl ReportingGate {
    pub fn new(
        policy: ReportPolicy,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn NotificationSink>,
        store: Arc<dyn ArtifactStore>,
        metrics: PipelineMetrics,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            policy,
            breaker,
            notifier,
            store,
            metrics,
            workspace_root,
        }
    }

    /// Apply the gate to one completed incident.
    pub async fn handle(&self, incident: &Incident, workspace: Option<&Workspace>) {
        // An incident that never reached a runner (queue expiry, panic
        // recovery) has no workspace yet; write its record here so every
        // accepted event leaves exactly one local record behind.
        if workspace.is_none() {
            let dir = incident.workspace_dir(&self.workspace_root);
            if let Err(e) = incident.write_record(&dir).await {
                error!(
                    incident_id = %incident.incident_id,
                    error = %e,
                    "Failed to write local incident record"
                );
            }
        }

        if incident.is_queue_expired() {
            self.metrics.incident_expired();
            if self.policy.upload_expired_incidents {
                self.persist(incident, workspace).await;
            }
            debug!(
                incident_id = %incident.incident_id,
                cluster = %incident.cluster,
                "Queue-expired incident recorded without notification"
            );
            return;
        }

        self.metrics.incident_completed(incident.status);

        match incident.status {
            IncidentStatus::Success => {
                let artifacts = self.persist(incident, workspace).await;
                self.notify_incident(incident, artifacts.as_ref()).await;
                if let Some(alert) = self.breaker.record_success() {
                    info!(
                        downtime_seconds = alert.downtime_seconds,
                        total_failures = alert.total_failures,
                        "Triage system recovered"
                    );
                    self.send(Notification::recovered(&alert)).await;
                }
            }
            IncidentStatus::Failed => {
                let artifacts = self.persist(incident, workspace).await;
                self.notify_incident(incident, artifacts.as_ref()).await;
            }
            IncidentStatus::AgentFailed | IncidentStatus::Timeout => {
                if self.policy.upload_failed_investigations {
                    self.persist(incident, workspace).await;
                }
                if self.policy.notify_on_agent_failure {
                    self.notify_incident(incident, None).await;
                }

                let reason = incident
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                if let Some(alert) = self.breaker.record_failure(&reason) {
                    warn!(
                        failure_count = alert.failure_count,
                        first_failure_at = %alert.first_failure_at,
                        "Agent failure threshold crossed, announcing degraded state"
                    );
                    self.send(Notification::degraded(&alert)).await;
                }
            }
            IncidentStatus::Pending | IncidentStatus::Running => {
                warn!(
                    incident_id = %incident.incident_id,
                    status = incident.status.as_str(),
                    "Reporting gate received an incomplete incident"
                );
            }
        }
    }

    /// Upload the artifact bundle. A storage failure is logged and
    /// swallowed; it never alters the incident status.
    async fn persist(
        &self,
        incident: &Incident,
        workspace: Option<&Workspace>,
    ) -> Option<IncidentArtifacts> {
        let artifacts = IncidentArtifacts::collect(incident, workspace).await;
        match self.store.upload(&artifacts).await {
            Ok(()) => {
                self.metrics.storage_upload();
                Some(artifacts)
            }
            Err(e) => {
                self.metrics.storage_failure();
                error!(
                    incident_id = %incident.incident_id,
                    store = %self.store.describe(),
                    error = %e,
                    "Artifact upload failed"
                );
                Some(artifacts)
            }
        }
    }

    async fn notify_incident(&self, incident: &Incident, artifacts: Option<&IncidentArtifacts>) {
        let investigation = artifacts.and_then(|a| a.investigation.as_deref());
        self.send(Notification::for_incident(incident, investigation))
            .await;
    }

    async fn send(&self, notification: Notification) {
        match self.notifier.notify(notification).await {
            Ok(true) => self.metrics.notification_sent(),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Notification delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FaultEvent, ResourceRef, Severity};
    use crate::incident::QUEUE_EXPIRED_REASON;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Records every notification it is asked to deliver.
    struct RecordingSink {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|n| match n {
                    Notification::Incident { .. } => "incident",
                    Notification::Degraded { .. } => "degraded",
                    Notification::Recovered { .. } => "recovered",
                })
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, notification: Notification) -> anyhow::Result<bool> {
            self.sent.lock().unwrap().push(notification);
            Ok(true)
        }
    }

    /// Counts uploads; optionally fails every one of them.
    struct CountingStore {
        uploads: Mutex<Vec<String>>,
        fail: bool,
    }

    impl CountingStore {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.uploads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ArtifactStore for CountingStore {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        async fn upload(&self, artifacts: &IncidentArtifacts) -> anyhow::Result<()> {
            self.uploads
                .lock()
                .unwrap()
                .push(artifacts.incident.incident_id.to_string());
            if self.fail {
                anyhow::bail!("storage unreachable");
            }
            Ok(())
        }
    }

    struct Harness {
        gate: ReportingGate,
        sink: Arc<RecordingSink>,
        store: Arc<CountingStore>,
        breaker: Arc<CircuitBreaker>,
        metrics: PipelineMetrics,
        _workspace_root: tempfile::TempDir,
    }

    fn harness_with(policy: ReportPolicy, failing_store: bool) -> Harness {
        let sink = RecordingSink::new();
        let store = CountingStore::new(failing_store);
        let breaker = Arc::new(CircuitBreaker::new(3, None));
        let metrics = PipelineMetrics::new();
        let workspace_root = tempfile::tempdir().unwrap();
        let gate = ReportingGate::new(
            policy,
            breaker.clone(),
            sink.clone(),
            store.clone(),
            metrics.clone(),
            workspace_root.path().to_path_buf(),
        );
        Harness {
            gate,
            sink,
            store,
            breaker,
            metrics,
            _workspace_root: workspace_root,
        }
    }

    fn harness() -> Harness {
        harness_with(
            ReportPolicy {
                notify_on_agent_failure: false,
                upload_failed_investigations: false,
                upload_expired_incidents: false,
            },
            false,
        )
    }

    fn incident_with_status(apply: impl FnOnce(&mut Incident)) -> Incident {
        let mut incident = Incident::from_event(&FaultEvent {
            cluster: "prod-east".to_string(),
            subscription_id: "sub-1".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Warning,
            fault_kind: "CrashLoopBackOff".to_string(),
            context: String::new(),
            resource: ResourceRef {
                kind: "Pod".to_string(),
                name: "p1".to_string(),
                namespace: Some("default".to_string()),
            },
            signals: None,
        });
        incident.mark_running();
        apply(&mut incident);
        incident
    }

    #[tokio::test]
    async fn test_success_persists_and_notifies() {
        let h = harness();
        let incident = incident_with_status(|i| i.complete_success(0));
        h.gate.handle(&incident, None).await;

        assert_eq!(h.store.count(), 1);
        assert_eq!(h.sink.kinds(), vec!["incident"]);
        assert_eq!(h.metrics.snapshot().notifications_sent, 1);
    }

    #[tokio::test]
    async fn test_agent_failure_is_silent_and_feeds_breaker() {
        let h = harness();
        let incident = incident_with_status(|i| i.complete_agent_failed(Some(7), "non-zero exit: 7"));
        h.gate.handle(&incident, None).await;

        assert_eq!(h.store.count(), 0);
        assert!(h.sink.kinds().is_empty());
        assert_eq!(h.breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_breaker_storm_emits_one_degraded_then_one_recovered() {
        let h = harness();
        for _ in 0..5 {
            let incident =
                incident_with_status(|i| i.complete_agent_failed(Some(7), "non-zero exit: 7"));
            h.gate.handle(&incident, None).await;
        }
        // Five failures, threshold three: exactly one degraded alert
        assert_eq!(h.sink.kinds(), vec!["degraded"]);

        let success = incident_with_status(|i| i.complete_success(0));
        h.gate.handle(&success, None).await;
        assert_eq!(h.sink.kinds(), vec!["degraded", "incident", "recovered"]);

        // A fresh failure after recovery stays silent until the
        // threshold is crossed again
        let incident = incident_with_status(|i| i.complete_agent_failed(Some(7), "non-zero exit: 7"));
        h.gate.handle(&incident, None).await;
        assert_eq!(h.sink.kinds(), vec!["degraded", "incident", "recovered"]);
    }

    #[tokio::test]
    async fn test_queue_expired_writes_record_only() {
        let h = harness();
        let incident = incident_with_status(|i| i.complete_failed(QUEUE_EXPIRED_REASON));
        h.gate.handle(&incident, None).await;

        assert_eq!(h.store.count(), 0);
        assert!(h.sink.kinds().is_empty());
        assert_eq!(h.metrics.snapshot().incidents_expired, 1);
        assert_eq!(h.breaker.consecutive_failures(), 0);

        let record = h
            ._workspace_root
            .path()
            .join(incident.incident_id.to_string())
            .join("incident.json");
        assert!(record.exists());
    }

    #[tokio::test]
    async fn test_queue_expired_upload_knob() {
        let h = harness_with(
            ReportPolicy {
                notify_on_agent_failure: false,
                upload_failed_investigations: false,
                upload_expired_incidents: true,
            },
            false,
        );
        let incident = incident_with_status(|i| i.complete_failed(QUEUE_EXPIRED_REASON));
        h.gate.handle(&incident, None).await;
        assert_eq!(h.store.count(), 1);
        assert!(h.sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_nonagent_failure_persists_and_notifies() {
        let h = harness();
        let incident = incident_with_status(|i| i.complete_failed("workspace setup failed"));
        h.gate.handle(&incident, None).await;
        assert_eq!(h.store.count(), 1);
        assert_eq!(h.sink.kinds(), vec!["incident"]);
        // Non-agent failures never feed the breaker
        assert_eq!(h.breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_block_notification() {
        let h = harness_with(
            ReportPolicy {
                notify_on_agent_failure: false,
                upload_failed_investigations: false,
                upload_expired_incidents: false,
            },
            true,
        );
        let incident = incident_with_status(|i| i.complete_success(0));
        h.gate.handle(&incident, None).await;

        assert_eq!(h.sink.kinds(), vec!["incident"]);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.storage_failures, 1);
        assert_eq!(snap.storage_uploads, 0);
    }

    #[tokio::test]
    async fn test_notify_on_agent_failure_knob() {
        let h = harness_with(
            ReportPolicy {
                notify_on_agent_failure: true,
                upload_failed_investigations: true,
                upload_expired_incidents: false,
            },
            false,
        );
        let incident = incident_with_status(|i| i.complete_timeout("wall-clock timeout after 300s"));
        h.gate.handle(&incident, None).await;

        assert_eq!(h.store.count(), 1);
        assert_eq!(h.sink.kinds(), vec!["incident"]);
        assert_eq!(h.breaker.consecutive_failures(), 1);
    }
}
