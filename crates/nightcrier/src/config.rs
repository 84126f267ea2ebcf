use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NightcrierConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
    pub agent: AgentConfig,
    pub pipeline: PipelineConfig,
    pub shutdown: ShutdownConfig,
    pub failures: FailurePolicyConfig,
    pub storage: StorageConfig,
    pub notifier: NotifierConfig,
    pub health: HealthConfig,
    pub probe: ProbeConfig,
    pub logging: LoggingConfig,
}

/// One monitoring endpoint to subscribe to. Immutable after load;
/// the validated form lives in the cluster registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterEntry {
    pub name: String,
    pub endpoint: String,
    pub auth_token: Option<String>,
    #[serde(default)]
    pub subscription_mode: SubscriptionMode,
    /// Read-only credential bundle handed to the probe and the agent.
    /// Required when triage is enabled.
    pub credential_path: Option<PathBuf>,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionMode {
    Faults,
    ResourceFaults,
}

impl Default for SubscriptionMode {
    fn default() -> Self {
        SubscriptionMode::Faults
    }
}

impl SubscriptionMode {
    /// Wire identifier sent in the subscribe command.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Faults => "faults",
            SubscriptionMode::ResourceFaults => "resource-faults",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// The external agent CLI (or a wrapper script around it).
    pub script_path: PathBuf,
    /// Which CLI family `script_path` launches; selects workspace quirks
    /// and the debug post-hook.
    #[serde(default)]
    pub cli: AgentCliKind,
    pub model: String,
    /// Comma-separated allow-list passed through to the agent.
    pub allowed_tools: String,
    /// File holding the skill-aware system prompt. When unset a built-in
    /// prompt is used.
    pub system_prompt_file: Option<PathBuf>,
    /// Extra operator-supplied prompt appended after the system prompt.
    pub additional_prompt: Option<String>,
    pub timeout_seconds: u64,
    /// Capture agent stdout/stderr into the workspace `logs/` subtree.
    #[serde(default)]
    pub debug: bool,
    /// Root directory under which per-incident workspaces are created.
    pub workspace_root: PathBuf,
    /// Minimum size of `output/investigation.md` for a run to count as
    /// a success.
    pub min_report_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCliKind {
    Claude,
    Generic,
}

impl Default for AgentCliKind {
    fn default() -> Self {
        AgentCliKind::Claude
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub max_concurrent_agents: usize,
    pub queue_max_age_seconds: u64,
    pub queue_sweep_interval_seconds: u64,
    /// Capacity of the fan-in event channel; stream clients apply
    /// backpressure when it fills.
    pub event_buffer: usize,
    /// Whether queue-expired incidents are still uploaded to storage.
    /// The local record is written either way.
    #[serde(default)]
    pub upload_expired_incidents: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Budget for draining already-accepted incidents before remaining
    /// agent subprocesses are force-cancelled.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailurePolicyConfig {
    /// Also emit per-incident notifications for agent_failed/timeout
    /// outcomes. The aggregated degraded/recovered pair is always on.
    #[serde(default)]
    pub notify_on_agent_failure: bool,
    /// Consecutive agent failures before the degraded alert fires.
    pub threshold_for_alert: u32,
    /// Upload artifacts of agent_failed/timeout incidents to storage.
    #[serde(default)]
    pub upload_failed_investigations: bool,
    /// When set, a failure arriving after this much silence restarts the
    /// breaker window instead of extending it.
    pub quiet_period_reset_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    /// Target directory for the filesystem store.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    None,
    Filesystem,
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::None
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    /// Chat webhook receiving incident and breaker notifications.
    /// When unset, notifications are no-ops.
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Port for the read-only health endpoint. 0 disables the surface.
    pub port: u16,
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    pub kubectl_path: PathBuf,
    pub timeout_seconds: u64,
    /// Mark the cluster `failed` in the health surface when the probe
    /// itself errors, instead of only dropping its events.
    #[serde(default)]
    pub fail_cluster_on_error: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

impl NightcrierConfig {
    /// Load configuration from nightcrier.toml and environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Compile-time defaults are the foundation; missing keys in
        // files/env fall back to them.
        let defaults = config::Config::try_from(&NightcrierConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        // Layer config files (overrides defaults). Locations in order:
        // 1. /etc/nightcrier/nightcrier.toml (production)
        // 2. config/nightcrier.toml (local development)
        // 3. crates/nightcrier/config/nightcrier.toml (workspace root)
        let config_paths = vec![
            "/etc/nightcrier/nightcrier",
            "config/nightcrier",
            "crates/nightcrier/config/nightcrier",
        ];

        for path in config_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Environment variables override everything. Double underscore
        // for nested keys: NIGHTCRIER_AGENT__MODEL.
        builder = builder.add_source(
            config::Environment::with_prefix("NIGHTCRIER")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate the non-cluster sections. Cluster entries (names,
    /// endpoints, credential bundles) are validated by the registry.
    pub fn validate(&self) -> Result<()> {
        if self.agent.script_path.as_os_str().is_empty() {
            anyhow::bail!("agent.script_path must be set");
        }
        if self.agent.timeout_seconds == 0 {
            anyhow::bail!("agent.timeout_seconds must be greater than zero");
        }
        if self.pipeline.max_concurrent_agents == 0 {
            anyhow::bail!("pipeline.max_concurrent_agents must be greater than zero");
        }
        if self.pipeline.queue_sweep_interval_seconds == 0 {
            anyhow::bail!("pipeline.queue_sweep_interval_seconds must be greater than zero");
        }
        if self.pipeline.event_buffer == 0 {
            anyhow::bail!("pipeline.event_buffer must be greater than zero");
        }
        if self.failures.threshold_for_alert == 0 {
            anyhow::bail!("failures.threshold_for_alert must be greater than zero");
        }
        if self.storage.kind == StorageKind::Filesystem && self.storage.path.is_none() {
            anyhow::bail!("storage.path is required when storage.kind = \"filesystem\"");
        }
        if self.health.port != 0 {
            format!("{}:{}", self.health.bind_address, self.health.port)
                .parse::<std::net::SocketAddr>()
                .context("Invalid health.bind_address/health.port")?;
        }
        Ok(())
    }
}

impl Default for NightcrierConfig {
    fn default() -> Self {
        Self {
            clusters: vec![],
            agent: AgentConfig {
                script_path: PathBuf::new(),
                cli: AgentCliKind::Claude,
                model: "default".to_string(),
                allowed_tools: "Bash,Read,Grep".to_string(),
                system_prompt_file: None,
                additional_prompt: None,
                timeout_seconds: 300,
                debug: false,
                workspace_root: PathBuf::from("incidents"),
                min_report_bytes: 100,
            },
            pipeline: PipelineConfig {
                max_concurrent_agents: 5,
                queue_max_age_seconds: 600,
                queue_sweep_interval_seconds: 60,
                event_buffer: 256,
                upload_expired_incidents: false,
            },
            shutdown: ShutdownConfig { timeout_seconds: 30 },
            failures: FailurePolicyConfig {
                notify_on_agent_failure: false,
                threshold_for_alert: 3,
                upload_failed_investigations: false,
                quiet_period_reset_seconds: None,
            },
            storage: StorageConfig {
                kind: StorageKind::None,
                path: None,
            },
            notifier: NotifierConfig {
                webhook_url: None,
                timeout_seconds: 10,
            },
            health: HealthConfig {
                port: 8080,
                bind_address: "0.0.0.0".to_string(),
            },
            probe: ProbeConfig {
                kubectl_path: PathBuf::from("kubectl"),
                timeout_seconds: 10,
                fail_cluster_on_error: false,
            },
            logging: LoggingConfig {
                level: "info,nightcrier=debug".to_string(),
                format: LogFormat::Pretty,
                output: LogOutput::Stdout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> NightcrierConfig {
        let mut cfg = NightcrierConfig::default();
        cfg.agent.script_path = PathBuf::from("/usr/local/bin/triage-agent");
        cfg
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_script_path_rejected() {
        let cfg = NightcrierConfig::default();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("agent.script_path"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut cfg = valid_config();
        cfg.pipeline.max_concurrent_agents = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("max_concurrent_agents"));
    }

    #[test]
    fn test_filesystem_storage_requires_path() {
        let mut cfg = valid_config();
        cfg.storage.kind = StorageKind::Filesystem;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("storage.path"));
    }

    #[test]
    fn test_subscription_mode_wire_names() {
        assert_eq!(SubscriptionMode::Faults.as_str(), "faults");
        assert_eq!(SubscriptionMode::ResourceFaults.as_str(), "resource-faults");
    }

    #[test]
    fn test_port_zero_skips_bind_validation() {
        let mut cfg = valid_config();
        cfg.health.port = 0;
        cfg.health.bind_address = "not an address".to_string();
        assert!(cfg.validate().is_ok());
    }
}
