use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::event::{FaultEvent, ResourceRef, Severity};

/// Failure reason stamped on incidents expired out of a cluster queue.
pub const QUEUE_EXPIRED_REASON: &str = "queue-expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    Running,
    Success,
    Failed,
    AgentFailed,
    Timeout,
}

impl IncidentStatus {
    /// Outcomes that feed the circuit breaker.
    pub fn is_agent_failure(&self) -> bool {
        matches!(self, IncidentStatus::AgentFailed | IncidentStatus::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Running => "running",
            IncidentStatus::Success => "success",
            IncidentStatus::Failed => "failed",
            IncidentStatus::AgentFailed => "agent_failed",
            IncidentStatus::Timeout => "timeout",
        }
    }
}

/// The unit of triage: one accepted fault event, one agent invocation,
/// one persisted record. Field order here is the on-disk `incident.json`
/// contract; timestamps serialize as RFC 3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub incident_id: Uuid,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub cluster: String,
    pub resource: ResourceRef,
    pub fault_type: String,
    pub severity: Severity,
    pub context: String,
    /// Timestamp of the originating fault event.
    pub timestamp: DateTime<Utc>,
}

impl Incident {
    /// Create a pending incident from an accepted event, flattening the
    /// event fields the record contract calls for.
    pub fn from_event(event: &FaultEvent) -> Self {
        Self {
            incident_id: Uuid::new_v4(),
            status: IncidentStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure_reason: None,
            cluster: event.cluster.clone(),
            resource: event.resource.clone(),
            fault_type: event.fault_kind.clone(),
            severity: event.severity,
            context: event.context.clone(),
            timestamp: event.timestamp,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = IncidentStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete_success(&mut self, exit_code: i32) {
        self.status = IncidentStatus::Success;
        self.exit_code = Some(exit_code);
        self.completed_at = Some(Utc::now());
    }

    pub fn complete_agent_failed(&mut self, exit_code: Option<i32>, reason: impl Into<String>) {
        self.status = IncidentStatus::AgentFailed;
        self.exit_code = exit_code;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn complete_timeout(&mut self, reason: impl Into<String>) {
        self.status = IncidentStatus::Timeout;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn complete_failed(&mut self, reason: impl Into<String>) {
        self.status = IncidentStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_queue_expired(&self) -> bool {
        self.status == IncidentStatus::Failed
            && self.failure_reason.as_deref() == Some(QUEUE_EXPIRED_REASON)
    }

    /// The incident's workspace directory under `workspace_root`.
    pub fn workspace_dir(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(self.incident_id.to_string())
    }

    /// Serialize the record exactly as it is written to disk.
    pub fn to_record_json(&self) -> serde_json::Result<String> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Write `incident.json` into `dir`, atomically (write-then-rename so
    /// readers never observe a partial record). Creates `dir` with
    /// owner-only permissions when it does not exist yet.
    pub async fn write_record(&self, dir: &Path) -> std::io::Result<PathBuf> {
        crate::runner::workspace::create_private_dir(dir).await?;

        let body = self
            .to_record_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let path = dir.join("incident.json");
        let tmp = dir.join("incident.json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}
