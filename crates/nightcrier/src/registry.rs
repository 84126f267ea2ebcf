use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

use crate::config::{ClusterEntry, SubscriptionMode};
use crate::error::RegistryError;

/// A validated cluster record. Immutable after registry construction.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub name: String,
    pub endpoint: Url,
    pub auth_token: Option<String>,
    pub subscription_mode: SubscriptionMode,
    pub credential_path: Option<PathBuf>,
    pub triage_enabled: bool,
    pub labels: HashMap<String, String>,
}

/// Owns the validated cluster list. Lookup by name and enumeration only;
/// no mutation after load.
#[derive(Debug)]
pub struct ClusterRegistry {
    clusters: Vec<Arc<ClusterSpec>>,
}

impl ClusterRegistry {
    /// Validate the configured cluster entries and build the registry.
    /// Any violation is fatal and names the offending cluster/field.
    pub fn from_entries(entries: &[ClusterEntry]) -> Result<Self, RegistryError> {
        if entries.is_empty() {
            return Err(RegistryError::EmptyClusterList);
        }

        let mut seen = HashSet::new();
        let mut clusters = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(RegistryError::EmptyName { index });
            }
            if !seen.insert(entry.name.clone()) {
                return Err(RegistryError::DuplicateName(entry.name.clone()));
            }

            let endpoint =
                Url::parse(&entry.endpoint).map_err(|e| RegistryError::InvalidEndpoint {
                    cluster: entry.name.clone(),
                    endpoint: entry.endpoint.clone(),
                    reason: e.to_string(),
                })?;

            if entry.triage.enabled {
                let path = entry.credential_path.as_deref().ok_or_else(|| {
                    RegistryError::MissingCredentialPath {
                        cluster: entry.name.clone(),
                    }
                })?;
                validate_credential_bundle(&entry.name, path)?;
            }

            clusters.push(Arc::new(ClusterSpec {
                name: entry.name.clone(),
                endpoint,
                auth_token: entry.auth_token.clone(),
                subscription_mode: entry.subscription_mode,
                credential_path: entry.credential_path.clone(),
                triage_enabled: entry.triage.enabled,
                labels: entry.labels.clone(),
            }));
        }

        Ok(Self { clusters })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterSpec>> {
        self.clusters.iter().find(|c| c.name == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClusterSpec>> {
        self.clusters.iter()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

// Credential bundles are kubeconfig-shaped YAML. Only the entry names and
// the context references are examined here; everything else belongs to
// the probe and the agent subprocess.
#[derive(Debug, Deserialize)]
struct CredentialBundle {
    #[serde(default)]
    clusters: Vec<NamedEntry>,
    #[serde(default)]
    users: Vec<NamedEntry>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Debug, Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}

fn bundle_error(cluster: &str, path: &Path, reason: impl Into<String>) -> RegistryError {
    RegistryError::CredentialBundle {
        cluster: cluster.to_string(),
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// A triage-enabled cluster must come with a usable credential bundle:
/// readable, at least one cluster/user/context entry, and a selected
/// context resolvable against those entries.
fn validate_credential_bundle(cluster: &str, path: &Path) -> Result<(), RegistryError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| bundle_error(cluster, path, format!("not readable: {e}")))?;

    let bundle: CredentialBundle = serde_yaml::from_str(&raw)
        .map_err(|e| bundle_error(cluster, path, format!("parse error: {e}")))?;

    if bundle.clusters.is_empty() {
        return Err(bundle_error(cluster, path, "no clusters defined"));
    }
    if bundle.users.is_empty() {
        return Err(bundle_error(cluster, path, "no users defined"));
    }
    if bundle.contexts.is_empty() {
        return Err(bundle_error(cluster, path, "no contexts defined"));
    }

    let selected = bundle
        .current_context
        .as_deref()
        .ok_or_else(|| bundle_error(cluster, path, "current-context is not set"))?;

    let context = bundle
        .contexts
        .iter()
        .find(|c| c.name == selected)
        .ok_or_else(|| {
            bundle_error(cluster, path, format!("current-context '{selected}' not found"))
        })?;

    if !bundle.clusters.iter().any(|c| c.name == context.context.cluster) {
        return Err(bundle_error(
            cluster,
            path,
            format!(
                "context '{selected}' references unknown cluster '{}'",
                context.context.cluster
            ),
        ));
    }
    if !bundle.users.iter().any(|u| u.name == context.context.user) {
        return Err(bundle_error(
            cluster,
            path,
            format!(
                "context '{selected}' references unknown user '{}'",
                context.context.user
            ),
        ));
    }

    Ok(())
}
