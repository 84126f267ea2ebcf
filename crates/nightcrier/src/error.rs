use thiserror::Error;

/// Fatal validation errors raised while building the cluster registry.
/// Each variant names the offending cluster/field so startup failures
/// are actionable without a debugger.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("clusters list is empty; at least one cluster must be configured")]
    EmptyClusterList,

    #[error("cluster #{index}: name must not be empty")]
    EmptyName { index: usize },

    #[error("duplicate cluster name: {0}")]
    DuplicateName(String),

    #[error("cluster '{cluster}': invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        cluster: String,
        endpoint: String,
        reason: String,
    },

    #[error("cluster '{cluster}': triage is enabled but credential_path is not set")]
    MissingCredentialPath { cluster: String },

    #[error("cluster '{cluster}': credential bundle {path}: {reason}")]
    CredentialBundle {
        cluster: String,
        path: String,
        reason: String,
    },
}

/// Errors from a single monitoring-stream session. Any of these (other
/// than `Cancelled`) sends the client into its backoff/reconnect loop.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe rejected: {0}")]
    SubscribeRejected(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("session idle for {0}s, assuming dead peer")]
    IdleTimeout(u64),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the agent runner's own machinery (workspace setup and
/// subprocess plumbing). Agent-reported failures are not errors: they are
/// classified into the incident outcome instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("workspace setup failed: {0}")]
    Workspace(String),

    #[error("failed to spawn agent process '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
