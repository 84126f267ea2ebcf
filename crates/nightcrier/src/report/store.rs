use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::config::{StorageConfig, StorageKind};
use crate::incident::Incident;
use crate::probe::ClusterPermissions;
use crate::runner::workspace::Workspace;

/// The bundle handed to storage for one completed incident. The
/// investigation field is what notifications quote; everything else is
/// audit material.
#[derive(Debug, Clone)]
pub struct IncidentArtifacts {
    pub incident: Incident,
    pub investigation: Option<String>,
    pub permissions: Option<ClusterPermissions>,
    pub prompt: Option<String>,
    pub log_files: Vec<PathBuf>,
}

impl IncidentArtifacts {
    /// Gather the bundle from a workspace, best-effort: whatever the run
    /// left behind is what gets uploaded.
    pub async fn collect(incident: &Incident, workspace: Option<&Workspace>) -> Self {
        let mut artifacts = Self {
            incident: incident.clone(),
            investigation: None,
            permissions: None,
            prompt: None,
            log_files: Vec::new(),
        };

        let Some(ws) = workspace else {
            return artifacts;
        };

        artifacts.investigation = tokio::fs::read_to_string(ws.investigation_path()).await.ok();
        artifacts.prompt = tokio::fs::read_to_string(ws.prompt_path()).await.ok();
        artifacts.permissions = match tokio::fs::read_to_string(ws.permissions_path()).await {
            Ok(raw) => serde_json::from_str(&raw).ok(),
            Err(_) => None,
        };
        artifacts.log_files = ws.existing_log_files();
        artifacts
    }
}

/// Storage seam. The backend behind it is a collaborator; only the
/// artifact contract lives here.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn describe(&self) -> String;

    async fn upload(&self, artifacts: &IncidentArtifacts) -> anyhow::Result<()>;
}

/// Mirrors artifact bundles into a directory tree, one subdirectory per
/// incident.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn upload(&self, artifacts: &IncidentArtifacts) -> anyhow::Result<()> {
        let dir = self.root.join(artifacts.incident.incident_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        tokio::fs::write(
            dir.join("incident.json"),
            artifacts.incident.to_record_json()?,
        )
        .await?;

        if let Some(investigation) = &artifacts.investigation {
            tokio::fs::write(dir.join("investigation.md"), investigation).await?;
        }
        if let Some(prompt) = &artifacts.prompt {
            tokio::fs::write(dir.join("prompt-sent.md"), prompt).await?;
        }
        if let Some(permissions) = &artifacts.permissions {
            let body = serde_json::to_string_pretty(permissions)?;
            tokio::fs::write(dir.join("incident_cluster_permissions.json"), body).await?;
        }
        for log in &artifacts.log_files {
            if let Some(name) = log.file_name() {
                tokio::fs::copy(log, dir.join(name)).await?;
            }
        }

        debug!(
            incident_id = %artifacts.incident.incident_id,
            target = %dir.display(),
            "Artifacts uploaded"
        );
        Ok(())
    }
}

/// Used when no storage is configured; the local incident record remains
/// the only persisted copy.
pub struct NoopArtifactStore;

#[async_trait]
impl ArtifactStore for NoopArtifactStore {
    fn describe(&self) -> String {
        "none".to_string()
    }

    async fn upload(&self, _artifacts: &IncidentArtifacts) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn from_config(config: &StorageConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    match config.kind {
        StorageKind::None => Ok(Arc::new(NoopArtifactStore)),
        StorageKind::Filesystem => {
            let root = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.path is required for the filesystem store"))?;
            Ok(Arc::new(FsArtifactStore::new(root)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FaultEvent, ResourceRef, Severity};
    use chrono::Utc;

    fn sample_incident() -> Incident {
        let mut incident = Incident::from_event(&FaultEvent {
            cluster: "prod-east".to_string(),
            subscription_id: "sub-1".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Error,
            fault_kind: "OOMKilled".to_string(),
            context: String::new(),
            resource: ResourceRef {
                kind: "Pod".to_string(),
                name: "api-0".to_string(),
                namespace: None,
            },
            signals: None,
        });
        incident.mark_running();
        incident.complete_success(0);
        incident
    }

    fn workspace_in(dir: &std::path::Path) -> Workspace {
        let ws = Workspace {
            root: dir.to_path_buf(),
            output_dir: dir.join("output"),
            context_dir: dir.join("context"),
            logs_dir: None,
        };
        std::fs::create_dir_all(&ws.output_dir).unwrap();
        ws
    }

    #[tokio::test]
    async fn test_collect_reads_what_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        std::fs::write(ws.investigation_path(), "# Findings\n\nOOM.").unwrap();

        let artifacts = IncidentArtifacts::collect(&sample_incident(), Some(&ws)).await;
        assert_eq!(artifacts.investigation.as_deref(), Some("# Findings\n\nOOM."));
        assert!(artifacts.prompt.is_none());
        assert!(artifacts.log_files.is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_mirrors_bundle() {
        let ws_tmp = tempfile::tempdir().unwrap();
        let store_tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(ws_tmp.path());
        std::fs::write(ws.investigation_path(), "findings").unwrap();

        let incident = sample_incident();
        let artifacts = IncidentArtifacts::collect(&incident, Some(&ws)).await;
        let store = FsArtifactStore::new(store_tmp.path().to_path_buf());
        store.upload(&artifacts).await.unwrap();

        let target = store_tmp.path().join(incident.incident_id.to_string());
        assert!(target.join("incident.json").exists());
        assert!(target.join("investigation.md").exists());
        assert!(!target.join("prompt-sent.md").exists());
    }

    #[test]
    fn test_from_config_selects_backend() {
        let noop = from_config(&StorageConfig {
            kind: StorageKind::None,
            path: None,
        })
        .unwrap();
        assert_eq!(noop.describe(), "none");

        let fs = from_config(&StorageConfig {
            kind: StorageKind::Filesystem,
            path: Some(PathBuf::from("/var/lib/nightcrier")),
        })
        .unwrap();
        assert!(fs.describe().starts_with("filesystem:"));
    }
}
