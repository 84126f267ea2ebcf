use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::incident::QUEUE_EXPIRED_REASON;
use crate::report::ReportingGate;

use super::queue::ClusterQueue;

/// Background task that expires incidents which sat in a cluster queue
/// longer than the configured maximum age. Expired incidents never reach
/// an agent; their record is written and the reporting gate stays quiet.
pub struct QueueSweeper {
    queues: Arc<DashMap<String, Arc<ClusterQueue>>>,
    gate: Arc<ReportingGate>,
    max_age: Duration,
    interval: Duration,
    stop: watch::Receiver<bool>,
}

impl QueueSweeper {
    pub fn new(
        queues: Arc<DashMap<String, Arc<ClusterQueue>>>,
        gate: Arc<ReportingGate>,
        max_age: Duration,
        interval: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queues,
            gate,
            max_age,
            interval,
            stop,
        }
    }

    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Queue sweeper started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        info!("Queue sweeper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every cluster queue. Expired entries are collected
    /// first so no queue lock is held across the gate's I/O.
    pub async fn sweep(&self) {
        let mut expired = Vec::new();
        for entry in self.queues.iter() {
            expired.extend(entry.value().expire(self.max_age));
        }

        for item in expired {
            let mut incident = item.incident;
            incident.complete_failed(QUEUE_EXPIRED_REASON);
            warn!(
                incident_id = %incident.incident_id,
                cluster = %incident.cluster,
                queued_secs = item.enqueued_at.elapsed().as_secs(),
                "Incident expired in queue before an agent slot opened"
            );
            self.gate.handle(&incident, None).await;
        }
    }
}
