use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::event::EnrichedSignal;
use crate::incident::Incident;
use crate::probe::ClusterPermissions;
use crate::registry::ClusterSpec;

/// One accepted incident waiting for its cluster's worker.
#[derive(Debug)]
pub struct QueuedIncident {
    pub incident: Incident,
    pub spec: Arc<ClusterSpec>,
    pub permissions: Arc<ClusterPermissions>,
    pub signals: Vec<EnrichedSignal>,
    pub enqueued_at: Instant,
}

/// Per-cluster FIFO. The intake side pushes, the cluster worker pops,
/// and the sweeper removes expired entries; FIFO order is what gives the
/// per-cluster completion-order guarantee.
pub struct ClusterQueue {
    items: parking_lot::Mutex<VecDeque<QueuedIncident>>,
    notify: Notify,
}

impl ClusterQueue {
    pub fn new() -> Self {
        Self {
            items: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, item: QueuedIncident) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<QueuedIncident> {
        self.items.lock().pop_front()
    }

    /// Wait for the next incident.
    pub async fn pop(&self) -> QueuedIncident {
        loop {
            // Register interest before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Remove every entry whose queue age has reached `max_age`.
    /// An entry exactly at the threshold is expired.
    pub fn expire(&self, max_age: Duration) -> Vec<QueuedIncident> {
        let mut items = self.items.lock();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(items.len());

        while let Some(item) = items.pop_front() {
            if item.enqueued_at.elapsed() >= max_age {
                expired.push(item);
            } else {
                kept.push_back(item);
            }
        }
        *items = kept;
        expired
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for ClusterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterEntry, SubscriptionMode, TriageConfig};
    use crate::event::{FaultEvent, ResourceRef, Severity};
    use crate::registry::ClusterRegistry;
    use chrono::Utc;

    fn queued() -> QueuedIncident {
        let entries = vec![ClusterEntry {
            name: "a".to_string(),
            endpoint: "https://monitor.example.com".to_string(),
            auth_token: None,
            subscription_mode: SubscriptionMode::Faults,
            credential_path: None,
            triage: TriageConfig { enabled: false },
            labels: Default::default(),
        }];
        let registry = ClusterRegistry::from_entries(&entries).unwrap();
        let event = FaultEvent {
            cluster: "a".to_string(),
            subscription_id: "sub-1".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Warning,
            fault_kind: "CrashLoopBackOff".to_string(),
            context: String::new(),
            resource: ResourceRef {
                kind: "Pod".to_string(),
                name: "p1".to_string(),
                namespace: None,
            },
            signals: None,
        };
        QueuedIncident {
            incident: Incident::from_event(&event),
            spec: registry.get("a").unwrap(),
            permissions: Arc::new(ClusterPermissions::denied("test")),
            signals: Vec::new(),
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = ClusterQueue::new();
        let first = queued();
        let second = queued();
        let first_id = first.incident.incident_id;

        queue.push(first);
        queue.push(second);
        assert_eq!(queue.try_pop().unwrap().incident.incident_id, first_id);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expire_removes_only_aged_entries() {
        let queue = ClusterQueue::new();
        queue.push(queued());
        std::thread::sleep(Duration::from_millis(50));
        queue.push(queued());

        // The older entry has reached the threshold, the fresh one has not
        let expired = queue.expire(Duration::from_millis(45));
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_age_threshold_expires_immediately() {
        // An entry exactly at the threshold is expired
        let queue = ClusterQueue::new();
        queue.push(queued());
        let expired = queue.expire(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expire_is_idempotent() {
        let queue = ClusterQueue::new();
        queue.push(queued());
        std::thread::sleep(Duration::from_millis(50));
        queue.push(queued());

        let first_sweep = queue.expire(Duration::from_millis(45));
        let second_sweep = queue.expire(Duration::from_millis(45));
        assert_eq!(first_sweep.len(), 1);
        assert!(second_sweep.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(ClusterQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(queued());

        let item = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.incident.cluster, "a");
    }
}
