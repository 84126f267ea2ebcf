use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::registry::ClusterSpec;

/// Capabilities checked per cluster, as (label, verb, resource) probes.
/// The first three form the minimum subset triage needs.
const CAPABILITIES: [(&str, &str, &str); 5] = [
    ("get-pods", "get", "pods"),
    ("get-logs", "get", "pods/log"),
    ("get-events", "get", "events"),
    ("describe", "list", "pods"),
    ("top-metrics", "get", "pods.metrics.k8s.io"),
];

const MINIMUM_CAPABILITIES: [&str; 3] = ["get-pods", "get-logs", "get-events"];

/// Measured read-only access for one cluster. Produced once at startup
/// and attached to every event from that cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPermissions {
    pub may_get_pods: bool,
    pub may_get_logs: bool,
    pub may_describe: bool,
    pub may_get_events: bool,
    pub may_top_metrics: bool,
    #[serde(default)]
    pub missing: Vec<String>,
    pub minimum_met: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<String>,
}

impl ClusterPermissions {
    /// Derive the record from raw capability answers, in CAPABILITIES order.
    fn derive(granted: [bool; 5], probe_error: Option<String>) -> Self {
        let missing: Vec<String> = CAPABILITIES
            .iter()
            .zip(granted.iter())
            .filter(|(_, ok)| !**ok)
            .map(|((label, _, _), _)| label.to_string())
            .collect();

        let minimum_met = probe_error.is_none()
            && MINIMUM_CAPABILITIES
                .iter()
                .all(|cap| !missing.iter().any(|m| m == cap));

        Self {
            may_get_pods: granted[0],
            may_get_logs: granted[1],
            may_get_events: granted[2],
            may_describe: granted[3],
            may_top_metrics: granted[4],
            missing,
            minimum_met,
            probe_error,
        }
    }

    /// Record for a cluster whose probe could not run at all.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::derive([false; 5], Some(reason.into()))
    }
}

/// Enumerate read-only capabilities for one triage-enabled cluster by
/// asking the access-review endpoint through `kubectl auth can-i`,
/// scoped to the cluster's credential bundle. Never mutates the target.
///
/// Probe errors downgrade the cluster (`minimum_met = false`) but do not
/// fail startup; unrelated clusters must stay usable.
pub async fn probe_cluster(config: &ProbeConfig, spec: &ClusterSpec) -> ClusterPermissions {
    let credential_path = match spec.credential_path.as_deref() {
        Some(path) => path,
        None => return ClusterPermissions::denied("no credential bundle configured"),
    };
    if !credential_path.exists() {
        return ClusterPermissions::denied(format!(
            "credential bundle {} not found",
            credential_path.display()
        ));
    }

    let timeout = Duration::from_secs(config.timeout_seconds);
    let mut granted = [false; 5];

    for (i, (label, verb, resource)) in CAPABILITIES.iter().enumerate() {
        match can_i(&config.kubectl_path, credential_path, verb, resource, timeout).await {
            Ok(allowed) => {
                granted[i] = allowed;
                debug!(
                    cluster = %spec.name,
                    capability = label,
                    allowed,
                    "Capability probe answered"
                );
            }
            Err(reason) => {
                warn!(cluster = %spec.name, capability = label, %reason, "Capability probe failed");
                return ClusterPermissions::derive(granted, Some(reason));
            }
        }
    }

    let permissions = ClusterPermissions::derive(granted, None);
    if !permissions.minimum_met {
        warn!(
            cluster = %spec.name,
            missing = ?permissions.missing,
            "Cluster is missing the minimum read-only capabilities; its events will be dropped"
        );
    }
    permissions
}

/// One `kubectl auth can-i <verb> <resource>` invocation. `can-i` answers
/// on stdout ("yes"/"no") and uses exit code 1 for "no", so the exit code
/// alone does not distinguish denial from breakage.
async fn can_i(
    kubectl: &Path,
    credential_path: &Path,
    verb: &str,
    resource: &str,
    timeout: Duration,
) -> Result<bool, String> {
    let mut command = Command::new(kubectl);
    command
        .arg("auth")
        .arg("can-i")
        .arg(verb)
        .arg(resource)
        .arg("--kubeconfig")
        .arg(credential_path)
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| format!("probe timed out after {}s", timeout.as_secs()))?
        .map_err(|e| format!("failed to run {}: {e}", kubectl.display()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let answer = stdout.trim();
    if answer.eq_ignore_ascii_case("yes") {
        Ok(true)
    } else if answer.eq_ignore_ascii_case("no") {
        Ok(false)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "unexpected probe answer '{answer}': {}",
            stderr.trim()
        ))
    }
}
