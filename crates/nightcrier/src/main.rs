mod config;
mod error;
mod event;
mod health;
mod incident;
mod manager;
mod metrics;
mod pipeline;
mod probe;
mod registry;
mod report;
mod runner;
mod state;
mod stream;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{LogFormat, LogOutput, NightcrierConfig};
use crate::manager::ConnectionManager;
use crate::metrics::PipelineMetrics;
use crate::pipeline::IncidentPipeline;
use crate::registry::ClusterRegistry;
use crate::report::breaker::CircuitBreaker;
use crate::report::notify::{NotificationSink, WebhookNotifier};
use crate::report::{ReportPolicy, ReportingGate};
use crate::runner::AgentRunner;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config loading can log. Thread-local so
    // phase 2 can install the configured global subscriber.
    let _basic_tracing = init_tracing_basic();

    info!("Starting Nightcrier v{}", env!("CARGO_PKG_VERSION"));

    let config = NightcrierConfig::load().context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let registry = Arc::new(
        ClusterRegistry::from_entries(&config.clusters)
            .context("Cluster configuration validation failed")?,
    );

    // Phase 2: re-initialize tracing from config (level, format, output)
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!(
        clusters = registry.len(),
        agent_cli = ?config.agent.cli,
        "Configuration loaded"
    );

    let config = Arc::new(config);
    let metrics = PipelineMetrics::new();
    let manager = Arc::new(
        ConnectionManager::new(
            registry.clone(),
            config.probe.clone(),
            config.pipeline.event_buffer,
        )
        .context("Failed to build connection manager")?,
    );
    let state = AppState::new(config.clone(), manager.clone(), metrics.clone());

    // Reporting side: breaker, webhook, storage
    let breaker = Arc::new(CircuitBreaker::new(
        config.failures.threshold_for_alert,
        config
            .failures
            .quiet_period_reset_seconds
            .map(Duration::from_secs),
    ));
    let notifier: Arc<dyn NotificationSink> = Arc::new(
        WebhookNotifier::new(&config.notifier).context("Failed to build notifier")?,
    );
    let store =
        report::store::from_config(&config.storage).context("Failed to build artifact store")?;
    info!(store = %store.describe(), "Artifact store ready");

    let gate = Arc::new(ReportingGate::new(
        ReportPolicy {
            notify_on_agent_failure: config.failures.notify_on_agent_failure,
            upload_failed_investigations: config.failures.upload_failed_investigations,
            upload_expired_incidents: config.pipeline.upload_expired_incidents,
        },
        breaker,
        notifier,
        store,
        metrics.clone(),
        config.agent.workspace_root.clone(),
    ));

    // Force-cancel flips only after the shutdown drain budget runs out;
    // in-flight agent subprocesses listen on it.
    let (force_cancel_tx, force_cancel_rx) = watch::channel(false);
    let runner = Arc::new(AgentRunner::new(config.agent.clone(), force_cancel_rx));

    // Probe clusters and start one stream client each
    let events_rx = manager.start().await;

    let pipeline = IncidentPipeline::new(
        config.pipeline.clone(),
        metrics.clone(),
        gate,
        runner,
        state.subscribe_shutdown(),
    );
    let mut pipeline_handle = tokio::spawn(pipeline.run(events_rx));

    // Health surface gets its own shutdown signal so it closes last
    let (health_shutdown_tx, health_shutdown_rx) = watch::channel(false);
    let health_handle = if config.health.port != 0 {
        let health_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(health_state, health_shutdown_rx).await {
                error!(error = %e, "Health surface failed");
            }
        }))
    } else {
        info!("Health endpoint disabled (health.port = 0)");
        None
    };

    info!("Nightcrier is ready");

    shutdown_signal().await;

    // Shutdown order: stop intake, drain accepted incidents within the
    // budget, force-cancel stragglers, close the health surface last.
    info!("Initiating graceful shutdown");
    state.shutdown();
    manager.stop().await;

    let budget = Duration::from_secs(config.shutdown.timeout_seconds);
    match tokio::time::timeout(budget, &mut pipeline_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!(error = %e, "Incident pipeline ended abnormally");
            }
        }
        Err(_) => {
            warn!(
                budget_secs = budget.as_secs(),
                "Shutdown budget exhausted, force-cancelling remaining agents"
            );
            let _ = force_cancel_tx.send(true);

            let grace = runner::process::GRACE_PERIOD + Duration::from_secs(5);
            match tokio::time::timeout(grace, &mut pipeline_handle).await {
                Ok(result) => {
                    if let Err(e) = result {
                        error!(error = %e, "Incident pipeline ended abnormally");
                    }
                }
                Err(_) => {
                    error!("Incident pipeline still stuck after force-cancel, aborting it");
                    pipeline_handle.abort();
                }
            }
        }
    }

    if let Some(health_handle) = health_handle {
        let _ = health_shutdown_tx.send(true);
        let _ = health_handle.await;
    }

    info!("Nightcrier shut down gracefully");
    Ok(())
}

/// Phase 1: basic tracing init so startup can log before the config is
/// available. Uses RUST_LOG or a sensible default.
fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nightcrier=debug"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: replace the global subscriber with one that respects the
/// configured level, format, and output.
fn init_tracing_from_config(config: &NightcrierConfig) {
    use std::sync::Arc;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match (&config.logging.format, &config.logging.output) {
        (LogFormat::Json, LogOutput::Stdout) => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Json, LogOutput::File { path }) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("Failed to open log file '{}': {}", path, e));
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::Stdout) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        (LogFormat::Pretty, LogOutput::File { path }) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| panic!("Failed to open log file '{}': {}", path, e));
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
