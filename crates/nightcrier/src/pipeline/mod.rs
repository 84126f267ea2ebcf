pub mod queue;
pub mod sweeper;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::incident::Incident;
use crate::manager::AnnotatedEvent;
use crate::metrics::PipelineMetrics;
use crate::report::ReportingGate;
use crate::runner::AgentRunner;

use queue::{ClusterQueue, QueuedIncident};
use sweeper::QueueSweeper;

/// The single consumer of the fan-in event channel.
///
/// Admission: events from clusters without triage or without the minimum
/// read-only access are dropped with an informational record. Everything
/// else becomes an incident in its cluster's FIFO. One worker per
/// cluster keeps at most one incident in flight per cluster; a global
/// semaphore caps total concurrent agent runs.
pub struct IncidentPipeline {
    config: PipelineConfig,
    metrics: PipelineMetrics,
    gate: Arc<ReportingGate>,
    runner: Arc<AgentRunner>,
    shutdown: watch::Receiver<bool>,
}

impl IncidentPipeline {
    pub fn new(
        config: PipelineConfig,
        metrics: PipelineMetrics,
        gate: Arc<ReportingGate>,
        runner: Arc<AgentRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            metrics,
            gate,
            runner,
            shutdown,
        }
    }

    /// Run until the event channel closes or shutdown is signalled, then
    /// drain already-accepted incidents and stop.
    pub async fn run(mut self, mut events: mpsc::Receiver<AnnotatedEvent>) {
        let queues: Arc<DashMap<String, Arc<ClusterQueue>>> = Arc::new(DashMap::new());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_agents));
        let (stop_tx, stop_rx) = watch::channel(false);

        let sweeper = QueueSweeper::new(
            queues.clone(),
            self.gate.clone(),
            Duration::from_secs(self.config.queue_max_age_seconds),
            Duration::from_secs(self.config.queue_sweep_interval_seconds),
            stop_rx.clone(),
        );
        let sweeper_handle = tokio::spawn(sweeper.run());

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        info!(
            max_concurrent_agents = self.config.max_concurrent_agents,
            "Incident pipeline started"
        );

        loop {
            let annotated = tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = events.recv() => match received {
                    Some(annotated) => annotated,
                    None => break,
                },
            };
            self.accept(annotated, &queues, &semaphore, &stop_rx, &mut workers);
        }

        info!("Event intake finished, draining accepted incidents");
        let _ = stop_tx.send(true);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Cluster worker did not stop cleanly");
            }
        }
        if let Err(e) = sweeper_handle.await {
            error!(error = %e, "Queue sweeper did not stop cleanly");
        }
        info!("Incident pipeline stopped");
    }

    fn accept(
        &self,
        annotated: AnnotatedEvent,
        queues: &Arc<DashMap<String, Arc<ClusterQueue>>>,
        semaphore: &Arc<Semaphore>,
        stop_rx: &watch::Receiver<bool>,
        workers: &mut Vec<JoinHandle<()>>,
    ) {
        self.metrics.event_received();
        let cluster = annotated.event.cluster.clone();

        if !annotated.spec.triage_enabled {
            debug!(cluster = %cluster, "Dropping event: triage disabled for cluster");
            self.metrics.event_dropped();
            return;
        }
        let Some(permissions) = annotated.permissions else {
            info!(cluster = %cluster, "Dropping event: cluster was never probed");
            self.metrics.event_dropped();
            return;
        };
        if !permissions.minimum_met {
            info!(
                cluster = %cluster,
                missing = ?permissions.missing,
                "Dropping event: cluster lacks the minimum read-only access"
            );
            self.metrics.event_dropped();
            return;
        }

        let incident = Incident::from_event(&annotated.event);
        self.metrics.incident_created();
        info!(
            incident_id = %incident.incident_id,
            cluster = %cluster,
            fault = %incident.fault_type,
            severity = incident.severity.as_str(),
            resource = %format!("{}/{}", incident.resource.kind, incident.resource.name),
            "Incident created"
        );

        let queue = match queues.get(&cluster) {
            Some(queue) => queue.value().clone(),
            None => {
                let queue = Arc::new(ClusterQueue::new());
                queues.insert(cluster.clone(), queue.clone());
                workers.push(spawn_worker(
                    cluster.clone(),
                    queue.clone(),
                    semaphore.clone(),
                    self.runner.clone(),
                    self.gate.clone(),
                    stop_rx.clone(),
                ));
                queue
            }
        };

        queue.push(QueuedIncident {
            incident,
            spec: annotated.spec,
            permissions,
            signals: annotated.event.signals.unwrap_or_default(),
            enqueued_at: Instant::now(),
        });
    }
}

/// One worker per cluster: at most one in-flight incident, FIFO order.
/// After the stop signal it drains what is already queued, then exits.
fn spawn_worker(
    cluster: String,
    queue: Arc<ClusterQueue>,
    semaphore: Arc<Semaphore>,
    runner: Arc<AgentRunner>,
    gate: Arc<ReportingGate>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(cluster = %cluster, "Cluster worker started");
        loop {
            let item = tokio::select! {
                item = queue.pop() => item,
                _ = stopped(&mut stop) => {
                    match queue.try_pop() {
                        Some(item) => item,
                        None => break,
                    }
                }
            };
            process_one(item, &semaphore, &runner, &gate).await;
        }
        debug!(cluster = %cluster, "Cluster worker stopped");
    })
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run one incident through the agent and hand the outcome to the gate.
/// The gate finishes (record written) before the worker can pick up the
/// next incident on this cluster.
async fn process_one(
    item: QueuedIncident,
    semaphore: &Arc<Semaphore>,
    runner: &Arc<AgentRunner>,
    gate: &Arc<ReportingGate>,
) {
    // Global cap: waiting here keeps the incident admitted, not dropped.
    let permit = match semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let QueuedIncident {
        incident,
        spec,
        permissions,
        signals,
        ..
    } = item;
    let fallback = incident.clone();

    // A panicking run is contained to its own task; the worker keeps
    // serving the queue.
    let run = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run(incident, spec, permissions, signals).await })
    };

    match run.await {
        Ok((completed, workspace)) => gate.handle(&completed, workspace.as_ref()).await,
        Err(e) => {
            error!(
                incident_id = %fallback.incident_id,
                cluster = %fallback.cluster,
                error = %e,
                "Agent task panicked"
            );
            let mut incident = fallback;
            incident.complete_failed(format!("internal error: agent task failed: {e}"));
            gate.handle(&incident, None).await;
        }
    }

    drop(permit);
}
