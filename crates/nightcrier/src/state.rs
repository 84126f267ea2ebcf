use std::sync::Arc;
use tokio::sync::watch;

use crate::config::NightcrierConfig;
use crate::manager::ConnectionManager;
use crate::metrics::PipelineMetrics;

/// Shared application state (thread-safe).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NightcrierConfig>,
    pub manager: Arc<ConnectionManager>,
    pub metrics: PipelineMetrics,
    /// Watch channel for shutdown signaling. Receivers always observe
    /// the latest value, even when they subscribe after the send.
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Arc<NightcrierConfig>,
        manager: Arc<ConnectionManager>,
        metrics: PipelineMetrics,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            manager,
            metrics,
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to every component listening on the watch.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
