use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Payload of the single "system degraded" notification emitted when the
/// failure threshold is crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedAlert {
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    /// Up to three reasons, oldest first.
    pub sample_reasons: Vec<String>,
}

/// Payload of the single "system recovered" notification emitted on the
/// first success after an open window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredAlert {
    pub downtime_seconds: u64,
    pub total_failures: u32,
}

const MAX_SAMPLE_REASONS: usize = 3;

/// Process-wide suppressor of agent-failure notification storms: one
/// degraded alert per window, one recovered alert when the window ends.
///
/// This is the one unavoidable global; it lives behind a single lock and
/// is handed around as one injected handle so tests can observe it.
pub struct CircuitBreaker {
    threshold: u32,
    /// When set, a failure arriving after this much silence restarts the
    /// window instead of extending it.
    quiet_period: Option<Duration>,
    state: parking_lot::Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    first_failure_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    open: bool,
    /// Latch preventing repeated opens within one window.
    alerted: bool,
    sample_reasons: Vec<String>,
}

impl BreakerState {
    fn reset(&mut self) {
        *self = BreakerState::default();
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, quiet_period: Option<Duration>) -> Self {
        Self {
            threshold,
            quiet_period,
            state: parking_lot::Mutex::new(BreakerState::default()),
        }
    }

    /// Record one agent_failed/timeout outcome. Returns the degraded
    /// alert exactly when this failure crosses the threshold of a window
    /// that has not alerted yet.
    pub fn record_failure(&self, reason: &str) -> Option<DegradedAlert> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if let (Some(quiet), Some(last)) = (self.quiet_period, state.last_failure_at) {
            let silence = now - last;
            if silence > ChronoDuration::from_std(quiet).unwrap_or(ChronoDuration::MAX) {
                state.reset();
            }
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let first_failure_at = *state.first_failure_at.get_or_insert(now);
        state.last_failure_at = Some(now);
        if state.sample_reasons.len() < MAX_SAMPLE_REASONS {
            state.sample_reasons.push(reason.to_string());
        }

        if state.consecutive_failures >= self.threshold && !state.open && !state.alerted {
            state.open = true;
            state.alerted = true;
            return Some(DegradedAlert {
                failure_count: state.consecutive_failures,
                first_failure_at,
                sample_reasons: state.sample_reasons.clone(),
            });
        }
        None
    }

    /// Record a success. Returns the recovered alert exactly when it
    /// closes an open window; a success before the threshold was crossed
    /// resets silently.
    pub fn record_success(&self) -> Option<RecoveredAlert> {
        let mut state = self.state.lock();
        let alert = if state.open {
            let downtime = state
                .first_failure_at
                .map(|first| (Utc::now() - first).num_seconds().max(0) as u64)
                .unwrap_or(0);
            Some(RecoveredAlert {
                downtime_seconds: downtime,
                total_failures: state.consecutive_failures,
            })
        } else {
            None
        };
        state.reset();
        alert
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_exactly_once_at_threshold() {
        let breaker = CircuitBreaker::new(3, None);

        assert!(breaker.record_failure("non-zero exit: 7").is_none());
        assert!(breaker.record_failure("non-zero exit: 7").is_none());

        let alert = breaker.record_failure("non-zero exit: 7").unwrap();
        assert_eq!(alert.failure_count, 3);
        assert_eq!(alert.sample_reasons.len(), 3);
        assert!(breaker.is_open());

        // Failures four and five stay silent
        assert!(breaker.record_failure("non-zero exit: 7").is_none());
        assert!(breaker.record_failure("non-zero exit: 7").is_none());
        assert_eq!(breaker.consecutive_failures(), 5);
    }

    #[test]
    fn test_recovered_only_after_open_window() {
        let breaker = CircuitBreaker::new(3, None);

        // Success with a short streak resets silently
        breaker.record_failure("a");
        assert!(breaker.record_success().is_none());
        assert_eq!(breaker.consecutive_failures(), 0);

        for _ in 0..3 {
            breaker.record_failure("b");
        }
        let recovered = breaker.record_success().unwrap();
        assert_eq!(recovered.total_failures, 3);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_rearms_after_recovery() {
        let breaker = CircuitBreaker::new(3, None);
        for _ in 0..5 {
            breaker.record_failure("x");
        }
        breaker.record_success().unwrap();

        // A fresh streak must cross the threshold again before alerting
        assert!(breaker.record_failure("y").is_none());
        assert!(breaker.record_failure("y").is_none());
        assert!(breaker.record_failure("y").is_some());
    }

    #[test]
    fn test_sample_reasons_keep_oldest_three() {
        let breaker = CircuitBreaker::new(5, None);
        for reason in ["one", "two", "three", "four"] {
            breaker.record_failure(reason);
        }
        let alert = breaker.record_failure("five").unwrap();
        assert_eq!(alert.sample_reasons, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_quiet_period_restarts_window() {
        let breaker = CircuitBreaker::new(3, Some(Duration::from_millis(1)));
        // With a 1ms quiet period every gap below exceeds it, so the
        // counter never accumulates and the threshold is never crossed.
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(5));
            assert!(breaker.record_failure("a").is_none());
        }
        assert_eq!(breaker.consecutive_failures(), 1);
    }
}
