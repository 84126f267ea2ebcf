pub mod process;
pub mod workspace;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AgentCliKind, AgentConfig};
use crate::error::RunnerError;
use crate::incident::Incident;
use crate::probe::ClusterPermissions;
use crate::registry::ClusterSpec;

use process::{LogCapture, ProcessOutcome};
use workspace::Workspace;

/// Portion of the wall-clock timeout withheld from the agent's own
/// deadline so it can flush its report before the hard kill.
const TIMEOUT_BUFFER: Duration = Duration::from_secs(5);

/// Classification of a subprocess run that returned normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success {
        exit_code: i32,
    },
    AgentFailed {
        exit_code: Option<i32>,
        reason: String,
    },
}

/// One concrete agent CLI. The runner drives every variant through the
/// same lifecycle: prepare workspace, invoke, classify, post-hook.
#[async_trait]
pub trait TriageAgent: Send + Sync {
    /// CLI identity recorded in prompt metadata and logs.
    fn cli_name(&self) -> &'static str;

    /// Build the workspace and the combined prompt for one incident.
    async fn prepare_workspace(
        &self,
        config: &AgentConfig,
        incident: &Incident,
        permissions: &ClusterPermissions,
    ) -> Result<(Workspace, String), RunnerError> {
        workspace::prepare(config, self.cli_name(), incident, permissions).await
    }

    /// Build the subprocess invocation.
    fn invoke(
        &self,
        config: &AgentConfig,
        ws: &Workspace,
        credential_path: &Path,
        prompt: &str,
        effective_timeout: Duration,
    ) -> Command;

    /// Classify a normally-returned run into an incident outcome.
    fn classify(&self, config: &AgentConfig, ws: &Workspace, outcome: &ProcessOutcome) -> Verdict {
        classify_outcome(config, ws, outcome)
    }

    /// Debug-only extraction after the run (session logs and the like).
    /// Failures here never change the incident outcome.
    async fn post_hook(&self, _ws: &Workspace) -> std::io::Result<()> {
        Ok(())
    }
}

/// Shared classification, in contract order: exit code first, then the
/// investigation report floor.
fn classify_outcome(config: &AgentConfig, ws: &Workspace, outcome: &ProcessOutcome) -> Verdict {
    match outcome.exit_code {
        Some(0) => {}
        Some(code) => {
            return Verdict::AgentFailed {
                exit_code: Some(code),
                reason: format!("non-zero exit: {code}"),
            }
        }
        None => {
            return Verdict::AgentFailed {
                exit_code: None,
                reason: "terminated by signal".to_string(),
            }
        }
    }

    let report_size = std::fs::metadata(ws.investigation_path())
        .map(|m| m.len())
        .unwrap_or(0);
    if report_size < config.min_report_bytes {
        return Verdict::AgentFailed {
            exit_code: Some(0),
            reason: "investigation report missing or too small".to_string(),
        };
    }

    Verdict::Success { exit_code: 0 }
}

/// The `claude` CLI: flag-driven invocation, and a session hook that
/// leaves an executed-commands log inside the workspace for extraction.
pub struct ClaudeCliAgent;

#[async_trait]
impl TriageAgent for ClaudeCliAgent {
    fn cli_name(&self) -> &'static str {
        "claude"
    }

    fn invoke(
        &self,
        config: &AgentConfig,
        ws: &Workspace,
        credential_path: &Path,
        prompt: &str,
        effective_timeout: Duration,
    ) -> Command {
        let mut cmd = Command::new(&config.script_path);
        cmd.current_dir(&ws.root)
            .arg("--model")
            .arg(&config.model)
            .arg("--allowed-tools")
            .arg(&config.allowed_tools)
            .arg("--timeout-seconds")
            .arg(effective_timeout.as_secs().to_string())
            .arg("--prompt")
            .arg(prompt)
            .env("KUBECONFIG", credential_path)
            .env("NIGHTCRIER_WORKSPACE", &ws.root);
        cmd
    }

    async fn post_hook(&self, ws: &Workspace) -> std::io::Result<()> {
        // The CLI's shell hook appends every executed command here;
        // surface it next to the captured streams when debugging.
        let Some(target) = ws.commands_log_path() else {
            return Ok(());
        };
        let source = ws.root.join(".claude").join("commands-executed.log");
        if !source.exists() {
            debug!("No executed-commands log to extract");
            return Ok(());
        }
        tokio::fs::copy(&source, &target).await?;
        Ok(())
    }
}

/// A conventions-only wrapper script: positional arguments, environment
/// for the rest, no session extraction.
pub struct GenericCliAgent;

#[async_trait]
impl TriageAgent for GenericCliAgent {
    fn cli_name(&self) -> &'static str {
        "generic"
    }

    fn invoke(
        &self,
        config: &AgentConfig,
        ws: &Workspace,
        credential_path: &Path,
        prompt: &str,
        effective_timeout: Duration,
    ) -> Command {
        let mut cmd = Command::new(&config.script_path);
        cmd.current_dir(&ws.root)
            .arg(&ws.root)
            .arg(prompt)
            .env("KUBECONFIG", credential_path)
            .env("NIGHTCRIER_MODEL", &config.model)
            .env("NIGHTCRIER_ALLOWED_TOOLS", &config.allowed_tools)
            .env(
                "NIGHTCRIER_TIMEOUT_SECONDS",
                effective_timeout.as_secs().to_string(),
            );
        cmd
    }
}

pub fn agent_for(kind: AgentCliKind) -> Arc<dyn TriageAgent> {
    match kind {
        AgentCliKind::Claude => Arc::new(ClaudeCliAgent),
        AgentCliKind::Generic => Arc::new(GenericCliAgent),
    }
}

/// Drives the full agent lifecycle for one incident. The workspace and
/// the incident record stay consistent at every observable point: the
/// record is written before the subprocess starts and rewritten with the
/// final outcome before the incident is handed on.
pub struct AgentRunner {
    config: AgentConfig,
    agent: Arc<dyn TriageAgent>,
    force_cancel: watch::Receiver<bool>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, force_cancel: watch::Receiver<bool>) -> Self {
        let agent = agent_for(config.cli);
        Self {
            config,
            agent,
            force_cancel,
        }
    }

    /// `signals` is the enriched material the originating event carried;
    /// it lands in the workspace context area for the agent.
    pub async fn run(
        &self,
        mut incident: Incident,
        spec: Arc<ClusterSpec>,
        permissions: Arc<ClusterPermissions>,
        signals: Vec<crate::event::EnrichedSignal>,
    ) -> (Incident, Option<Workspace>) {
        let (ws, prompt) = match self
            .agent
            .prepare_workspace(&self.config, &incident, &permissions)
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(incident_id = %incident.incident_id, error = %e, "Workspace setup failed");
                incident.complete_failed(format!("workspace setup failed: {e}"));
                return (incident, None);
            }
        };

        if !signals.is_empty() {
            if let Err(e) = workspace::write_signals(&ws, &signals).await {
                warn!(incident_id = %incident.incident_id, error = %e, "Failed to write context signals");
            }
        }

        let Some(credential_path) = spec.credential_path.as_deref() else {
            incident.complete_failed("cluster has no credential bundle");
            let _ = incident.write_record(&ws.root).await;
            return (incident, Some(ws));
        };

        incident.mark_running();
        if let Err(e) = incident.write_record(&ws.root).await {
            warn!(incident_id = %incident.incident_id, error = %e, "Failed to refresh incident record");
        }

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let effective_timeout = timeout
            .checked_sub(TIMEOUT_BUFFER)
            .unwrap_or(Duration::from_secs(1));

        let command = self
            .agent
            .invoke(&self.config, &ws, credential_path, &prompt, effective_timeout);

        let capture = match (&ws.stdout_log_path(), &ws.stderr_log_path(), &ws.full_log_path()) {
            (Some(stdout_log), Some(stderr_log), Some(full_log)) => Some(LogCapture {
                stdout_log: stdout_log.clone(),
                stderr_log: stderr_log.clone(),
                full_log: full_log.clone(),
            }),
            _ => None,
        };

        info!(
            incident_id = %incident.incident_id,
            cluster = %incident.cluster,
            agent = self.agent.cli_name(),
            timeout_secs = timeout.as_secs(),
            "Launching agent"
        );

        match process::execute(command, timeout, capture, self.force_cancel.clone()).await {
            Err(e) => {
                error!(incident_id = %incident.incident_id, error = %e, "Agent invocation failed");
                incident.complete_failed(format!("agent invocation failed: {e}"));
            }
            Ok(outcome) if outcome.cancelled => {
                incident.complete_timeout("cancelled during shutdown");
            }
            Ok(outcome) if outcome.timed_out => {
                incident.complete_timeout(format!(
                    "wall-clock timeout after {}s",
                    timeout.as_secs()
                ));
            }
            Ok(outcome) => match self.agent.classify(&self.config, &ws, &outcome) {
                Verdict::Success { exit_code } => incident.complete_success(exit_code),
                Verdict::AgentFailed { exit_code, reason } => {
                    incident.complete_agent_failed(exit_code, reason)
                }
            },
        }

        if self.config.debug {
            if let Err(e) = self.agent.post_hook(&ws).await {
                warn!(incident_id = %incident.incident_id, error = %e, "Agent post-hook failed");
            }
        }

        if let Err(e) = incident.write_record(&ws.root).await {
            error!(incident_id = %incident.incident_id, error = %e, "Failed to write final incident record");
        }

        (incident, Some(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NightcrierConfig;
    use std::path::PathBuf;

    fn agent_config(min_report_bytes: u64) -> AgentConfig {
        let mut cfg = NightcrierConfig::default().agent;
        cfg.script_path = PathBuf::from("/bin/true");
        cfg.min_report_bytes = min_report_bytes;
        cfg
    }

    fn workspace_in(dir: &Path) -> Workspace {
        let ws = Workspace {
            root: dir.to_path_buf(),
            output_dir: dir.join("output"),
            context_dir: dir.join("context"),
            logs_dir: None,
        };
        std::fs::create_dir_all(&ws.output_dir).unwrap();
        ws
    }

    fn completed(exit_code: Option<i32>) -> ProcessOutcome {
        ProcessOutcome {
            exit_code,
            timed_out: false,
            cancelled: false,
        }
    }

    #[test]
    fn test_nonzero_exit_classified_agent_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        let verdict = classify_outcome(&agent_config(100), &ws, &completed(Some(7)));
        assert_eq!(
            verdict,
            Verdict::AgentFailed {
                exit_code: Some(7),
                reason: "non-zero exit: 7".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_report_classified_agent_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        let verdict = classify_outcome(&agent_config(100), &ws, &completed(Some(0)));
        assert_eq!(
            verdict,
            Verdict::AgentFailed {
                exit_code: Some(0),
                reason: "investigation report missing or too small".to_string(),
            }
        );
    }

    #[test]
    fn test_report_floor_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        let config = agent_config(100);

        // Exactly the floor passes
        std::fs::write(ws.investigation_path(), vec![b'x'; 100]).unwrap();
        assert_eq!(
            classify_outcome(&config, &ws, &completed(Some(0))),
            Verdict::Success { exit_code: 0 }
        );

        // One byte under fails
        std::fs::write(ws.investigation_path(), vec![b'x'; 99]).unwrap();
        assert!(matches!(
            classify_outcome(&config, &ws, &completed(Some(0))),
            Verdict::AgentFailed { .. }
        ));
    }

    #[test]
    fn test_signal_death_classified_agent_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        let verdict = classify_outcome(&agent_config(100), &ws, &completed(None));
        assert!(matches!(verdict, Verdict::AgentFailed { exit_code: None, .. }));
    }

    #[test]
    fn test_claude_invocation_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_in(tmp.path());
        let config = agent_config(100);

        let cmd = ClaudeCliAgent.invoke(
            &config,
            &ws,
            Path::new("/etc/nightcrier/prod.kubeconfig"),
            "investigate",
            Duration::from_secs(295),
        );
        let std_cmd = cmd.as_std();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--timeout-seconds".to_string()));
        assert!(args.contains(&"295".to_string()));

        let envs: Vec<_> = std_cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert!(envs.iter().any(|(k, v)| k == "KUBECONFIG" && v.ends_with("prod.kubeconfig")));
    }

    #[test]
    fn test_agent_for_dispatch() {
        assert_eq!(agent_for(AgentCliKind::Claude).cli_name(), "claude");
        assert_eq!(agent_for(AgentCliKind::Generic).cli_name(), "generic");
    }
}
