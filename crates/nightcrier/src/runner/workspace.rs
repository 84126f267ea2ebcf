use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::RunnerError;
use crate::incident::Incident;
use crate::probe::ClusterPermissions;

/// Fallback system prompt when `agent.system_prompt_file` is not set.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an infrastructure triage investigator with read-only access to one \
cluster. A fault event has been captured for you; its record is in \
`incident.json` and the scope of your access is in \
`incident_cluster_permissions.json`. Supporting material, when present, is \
under `context/`. Use the skills available to you to investigate the fault: \
inspect the affected resource, read its logs and recent events, and form a \
root-cause hypothesis. Never modify the cluster. Write your findings as \
markdown to `output/investigation.md`: a one-paragraph summary, the evidence \
you collected, your root-cause analysis, and suggested next steps.";

/// A per-incident directory tree, exclusively owned by the agent runner
/// for the incident's duration.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub context_dir: PathBuf,
    /// Present only when debug capture is enabled.
    pub logs_dir: Option<PathBuf>,
}

impl Workspace {
    pub fn investigation_path(&self) -> PathBuf {
        self.output_dir.join("investigation.md")
    }

    pub fn incident_record_path(&self) -> PathBuf {
        self.root.join("incident.json")
    }

    pub fn permissions_path(&self) -> PathBuf {
        self.root.join("incident_cluster_permissions.json")
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.root.join("prompt-sent.md")
    }

    pub fn stdout_log_path(&self) -> Option<PathBuf> {
        self.logs_dir.as_ref().map(|d| d.join("agent-stdout.log"))
    }

    pub fn stderr_log_path(&self) -> Option<PathBuf> {
        self.logs_dir.as_ref().map(|d| d.join("agent-stderr.log"))
    }

    pub fn full_log_path(&self) -> Option<PathBuf> {
        self.logs_dir.as_ref().map(|d| d.join("agent-full.log"))
    }

    pub fn commands_log_path(&self) -> Option<PathBuf> {
        self.logs_dir
            .as_ref()
            .map(|d| d.join("agent-commands-executed.log"))
    }

    /// Log files that actually exist, for the artifact bundle.
    pub fn existing_log_files(&self) -> Vec<PathBuf> {
        [
            self.stdout_log_path(),
            self.stderr_log_path(),
            self.full_log_path(),
            self.commands_log_path(),
        ]
        .into_iter()
        .flatten()
        .filter(|p| p.exists())
        .collect()
    }
}

/// Create a directory (and its missing parents) and restrict the leaf to
/// owner read/write/execute only.
pub async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Build the workspace for one incident: the directory tree, the incident
/// record, the permissions record, the context area, and `prompt-sent.md`.
/// All of these exist before the subprocess is launched.
///
/// Returns the workspace and the combined prompt handed to the agent.
pub async fn prepare(
    config: &AgentConfig,
    cli_name: &str,
    incident: &Incident,
    permissions: &ClusterPermissions,
) -> Result<(Workspace, String), RunnerError> {
    let root = incident.workspace_dir(&config.workspace_root);
    let workspace = Workspace {
        output_dir: root.join("output"),
        context_dir: root.join("context"),
        logs_dir: config.debug.then(|| root.join("logs")),
        root,
    };

    create_private_dir(&workspace.root)
        .await
        .map_err(|e| RunnerError::Workspace(format!("{}: {e}", workspace.root.display())))?;
    create_private_dir(&workspace.output_dir).await?;
    create_private_dir(&workspace.context_dir).await?;
    if let Some(logs_dir) = &workspace.logs_dir {
        create_private_dir(logs_dir).await?;
    }

    incident.write_record(&workspace.root).await?;

    let permissions_json = serde_json::to_string_pretty(permissions)
        .map_err(|e| RunnerError::Workspace(format!("permissions record: {e}")))?;
    tokio::fs::write(workspace.permissions_path(), permissions_json + "\n").await?;

    let system_prompt = match &config.system_prompt_file {
        Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            RunnerError::Workspace(format!("system prompt {}: {e}", path.display()))
        })?,
        None => DEFAULT_SYSTEM_PROMPT.to_string(),
    };

    let prompt_file = render_prompt_file(
        incident,
        cli_name,
        &config.model,
        &system_prompt,
        config.additional_prompt.as_deref(),
    );
    tokio::fs::write(workspace.prompt_path(), prompt_file).await?;

    debug!(
        incident_id = %incident.incident_id,
        workspace = %workspace.root.display(),
        "Workspace prepared"
    );

    Ok((workspace, combined_prompt(&system_prompt, config.additional_prompt.as_deref())))
}

/// The prompt actually handed to the subprocess.
fn combined_prompt(system_prompt: &str, additional_prompt: Option<&str>) -> String {
    match additional_prompt.filter(|p| !p.trim().is_empty()) {
        Some(extra) => format!("{}\n\n{}", system_prompt.trim_end(), extra.trim()),
        None => system_prompt.trim_end().to_string(),
    }
}

/// `prompt-sent.md`: an audit copy of exactly what the agent was given.
fn render_prompt_file(
    incident: &Incident,
    cli_name: &str,
    model: &str,
    system_prompt: &str,
    additional_prompt: Option<&str>,
) -> String {
    let additional = match additional_prompt.filter(|p| !p.trim().is_empty()) {
        Some(extra) => extra.trim(),
        None => "None provided",
    };

    format!(
        "# Prompt Sent to Agent\n\
         \n\
         ## Metadata\n\
         \n\
         - Timestamp: {timestamp}\n\
         - Incident: {incident_id}\n\
         - Cluster: {cluster}\n\
         - Agent CLI: {cli}\n\
         - Model: {model}\n\
         \n\
         ## System Prompt\n\
         \n\
         {system_prompt}\n\
         \n\
         ## Additional Prompt\n\
         \n\
         {additional}\n",
        timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        incident_id = incident.incident_id,
        cluster = incident.cluster,
        cli = cli_name,
        model = model,
        system_prompt = system_prompt.trim_end(),
        additional = additional,
    )
}

/// Drop any enriched signals the event carried into the context area so
/// the agent does not have to re-fetch them.
pub async fn write_signals(
    workspace: &Workspace,
    signals: &[crate::event::EnrichedSignal],
) -> std::io::Result<()> {
    for (i, signal) in signals.iter().enumerate() {
        let name = signal
            .kind
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>();
        let path = workspace.context_dir.join(format!("signal-{i}-{name}.txt"));
        tokio::fs::write(path, &signal.content).await?;
    }
    Ok(())
}
