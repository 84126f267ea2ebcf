use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ProbeConfig;
use crate::event::FaultEvent;
use crate::probe::{self, ClusterPermissions};
use crate::registry::{ClusterRegistry, ClusterSpec};
use crate::stream::StreamClient;

/// Connection lifecycle of one cluster's stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Active,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Active => "active",
            ConnectionState::Failed => "failed",
        }
    }
}

/// A fault event annotated with its cluster record and the permissions
/// measured at startup, as handed to the incident pipeline.
#[derive(Debug, Clone)]
pub struct AnnotatedEvent {
    pub event: FaultEvent,
    pub spec: Arc<ClusterSpec>,
    pub permissions: Option<Arc<ClusterPermissions>>,
}

/// Mutable per-cluster connection status. The lock is held only for
/// status transitions; the event counter is lock-free.
pub struct ClusterStatus {
    name: String,
    inner: parking_lot::RwLock<StatusInner>,
    event_count: AtomicU64,
}

#[derive(Debug)]
struct StatusInner {
    state: ConnectionState,
    last_event: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl ClusterStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: parking_lot::RwLock::new(StatusInner {
                state: ConnectionState::Disconnected,
                last_event: None,
                last_error: None,
                retry_at: None,
                consecutive_failures: 0,
            }),
            event_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn mark_connecting(&self) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Connecting;
        inner.retry_at = None;
    }

    pub fn mark_subscribing(&self) {
        self.inner.write().state = ConnectionState::Subscribing;
    }

    pub fn mark_active(&self) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Active;
        inner.last_error = None;
        inner.retry_at = None;
        inner.consecutive_failures = 0;
    }

    pub fn mark_failed(&self, reason: String, retry_at: impl Into<Option<DateTime<Utc>>>) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Failed;
        inner.last_error = Some(reason);
        inner.retry_at = retry_at.into();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
    }

    pub fn record_event(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_event = Some(Utc::now());
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    fn observe(&self) -> (StatusView, u64) {
        let inner = self.inner.read();
        (
            StatusView {
                state: inner.state,
                last_event: inner.last_event,
                last_error: inner.last_error.clone(),
                retry_at: inner.retry_at,
                consecutive_failures: inner.consecutive_failures,
            },
            self.event_count(),
        )
    }
}

struct StatusView {
    state: ConnectionState,
    last_event: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    consecutive_failures: u32,
}

/// Health surface payload for one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub name: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds until the next reconnect attempt, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<u64>,
    pub event_count: u64,
    pub triage_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ClusterPermissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub active: usize,
    pub unhealthy: usize,
    pub triage_enabled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub clusters: Vec<ClusterHealth>,
    pub summary: HealthSummary,
}

/// Spawns one stream client per cluster and fans their events into a
/// single bounded channel. Per-cluster stream order is preserved in the
/// fan-in; cross-cluster order is nondeterministic.
pub struct ConnectionManager {
    registry: Arc<ClusterRegistry>,
    probe_config: ProbeConfig,
    http: reqwest::Client,
    statuses: DashMap<String, Arc<ClusterStatus>>,
    permissions: DashMap<String, Arc<ClusterPermissions>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    event_buffer: usize,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        probe_config: ProbeConfig,
        event_buffer: usize,
    ) -> anyhow::Result<Self> {
        // One transport pool shared by every cluster's sessions, so
        // adding clusters does not multiply socket churn.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            registry,
            probe_config,
            http,
            statuses: DashMap::new(),
            permissions: DashMap::new(),
            shutdown_tx: watch::channel(false).0,
            tasks: parking_lot::Mutex::new(Vec::new()),
            event_buffer,
        })
    }

    /// Probe triage-enabled clusters, then spawn one stream client per
    /// cluster. Returns the receiving side of the fan-in channel; the
    /// channel closes once every client has stopped.
    pub async fn start(&self) -> mpsc::Receiver<AnnotatedEvent> {
        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);

        let probes = futures::future::join_all(
            self.registry
                .iter()
                .filter(|spec| spec.triage_enabled)
                .map(|spec| {
                    let spec = spec.clone();
                    async move {
                        let permissions = probe::probe_cluster(&self.probe_config, &spec).await;
                        (spec.name.clone(), permissions)
                    }
                }),
        )
        .await;

        for (name, permissions) in probes {
            info!(
                cluster = %name,
                minimum_met = permissions.minimum_met,
                missing = ?permissions.missing,
                "Permission probe complete"
            );
            self.permissions.insert(name, Arc::new(permissions));
        }

        for spec in self.registry.iter() {
            let status = self.ensure_status(spec);
            let permissions = self.permissions.get(&spec.name).map(|p| p.value().clone());

            // A broken probe can optionally hold the cluster in `failed`
            // instead of streaming events that will all be dropped.
            if self.probe_config.fail_cluster_on_error {
                if let Some(reason) = permissions
                    .as_ref()
                    .and_then(|p| p.probe_error.clone())
                {
                    warn!(cluster = %spec.name, %reason, "Holding cluster in failed state");
                    status.mark_failed(format!("permission probe failed: {reason}"), None);
                    continue;
                }
            }

            let client = StreamClient::new(
                spec.clone(),
                self.http.clone(),
                status,
                permissions,
                events_tx.clone(),
                self.shutdown_tx.subscribe(),
            );

            let name = spec.name.clone();
            let handle = tokio::spawn(async move {
                client.run().await;
            });
            info!(cluster = %name, "Stream client started");
            self.tasks.lock().push(handle);
        }

        // The clients own the only senders now; the channel closes when
        // the last one stops.
        drop(events_tx);
        events_rx
    }

    /// Permissions measured for a cluster at startup, if it was probed.
    pub fn permissions_for(&self, cluster: &str) -> Option<Arc<ClusterPermissions>> {
        self.permissions.get(cluster).map(|p| p.value().clone())
    }

    pub(crate) fn ensure_status(&self, spec: &Arc<ClusterSpec>) -> Arc<ClusterStatus> {
        self.statuses
            .entry(spec.name.clone())
            .or_insert_with(|| Arc::new(ClusterStatus::new(spec.name.clone())))
            .value()
            .clone()
    }

    /// Point-in-time view of every cluster plus aggregate totals, in
    /// registry order.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let now = Utc::now();
        let mut clusters = Vec::with_capacity(self.registry.len());
        let mut active = 0;
        let mut unhealthy = 0;
        let mut triage_enabled = 0;

        for spec in self.registry.iter() {
            if spec.triage_enabled {
                triage_enabled += 1;
            }

            let (view, event_count) = match self.statuses.get(&spec.name) {
                Some(status) => status.observe(),
                None => (
                    StatusView {
                        state: ConnectionState::Disconnected,
                        last_event: None,
                        last_error: None,
                        retry_at: None,
                        consecutive_failures: 0,
                    },
                    0,
                ),
            };

            match view.state {
                ConnectionState::Active => active += 1,
                ConnectionState::Failed => unhealthy += 1,
                _ => {}
            }

            let retry_in = view
                .retry_at
                .map(|at| (at - now).num_seconds().max(0) as u64);

            clusters.push(ClusterHealth {
                name: spec.name.clone(),
                status: view.state.as_str(),
                last_event: view.last_event,
                error: view.last_error,
                retry_in,
                event_count,
                triage_enabled: spec.triage_enabled,
                permissions: self
                    .permissions
                    .get(&spec.name)
                    .map(|p| p.value().as_ref().clone()),
                labels: if spec.labels.is_empty() {
                    None
                } else {
                    Some(spec.labels.clone())
                },
            });
        }

        HealthSnapshot {
            summary: HealthSummary {
                total: clusters.len(),
                active,
                unhealthy,
                triage_enabled,
            },
            clusters,
        }
    }

    /// Cancel every stream client and wait for them to stop. After this
    /// returns, the fan-in channel is closed and drained by its consumer.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Stream client task did not stop cleanly");
            }
        }
        info!("All stream clients stopped");
    }
}
