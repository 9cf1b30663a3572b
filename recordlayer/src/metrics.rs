//! Transaction attempt metrics and the listener pipeline the runner notifies.

use std::sync::Mutex;

/// Timing and outcome data for a single transaction-runner attempt (success or failure).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptMetrics {
    pub total_nanos: u64,
    pub get_read_version_nanos: u64,
    pub user_code_nanos: u64,
    pub commit_nanos: u64,
    pub retry_count: u32,
    pub read_version: Option<i64>,
    pub commit_version: Option<i64>,
    pub read_version_cached: bool,
    pub succeeded: bool,
}

/// Receives a notification after every transaction-runner attempt.
pub trait RunnerListener: Send + Sync {
    fn on_attempt(&self, metrics: &AttemptMetrics);
}

#[derive(Debug, Default)]
struct AggregatedState {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_retries: u64,
    total_nanos_sum: u128,
    commit_nanos_sum: u128,
}

/// A built-in [`RunnerListener`] that keeps running counts and latency sums behind a `Mutex`,
/// grounded in the pack's prevailing shared-state pattern: one process-wide, lock-protected
/// aggregate rather than a per-call allocation.
#[derive(Debug, Default)]
pub struct AggregatingListener {
    state: Mutex<AggregatedState>,
}

/// A point-in-time snapshot of an [`AggregatingListener`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_retries: u64,
    pub average_total_nanos: f64,
    pub average_commit_nanos: f64,
}

impl AggregatingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AggregatedMetrics {
        let state = self.state.lock().expect("aggregating listener mutex poisoned");
        let average_total_nanos = if state.attempts == 0 {
            0.0
        } else {
            state.total_nanos_sum as f64 / state.attempts as f64
        };
        let average_commit_nanos = if state.successes == 0 {
            0.0
        } else {
            state.commit_nanos_sum as f64 / state.successes as f64
        };
        AggregatedMetrics {
            attempts: state.attempts,
            successes: state.successes,
            failures: state.failures,
            total_retries: state.total_retries,
            average_total_nanos,
            average_commit_nanos,
        }
    }
}

impl RunnerListener for AggregatingListener {
    fn on_attempt(&self, metrics: &AttemptMetrics) {
        let mut state = self.state.lock().expect("aggregating listener mutex poisoned");
        state.attempts += 1;
        state.total_retries += u64::from(metrics.retry_count);
        state.total_nanos_sum += u128::from(metrics.total_nanos);
        if metrics.succeeded {
            state.successes += 1;
            state.commit_nanos_sum += u128::from(metrics.commit_nanos);
        } else {
            state.failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(succeeded: bool, retry_count: u32) -> AttemptMetrics {
        AttemptMetrics {
            total_nanos: 1_000,
            get_read_version_nanos: 100,
            user_code_nanos: 500,
            commit_nanos: 300,
            retry_count,
            read_version: Some(1),
            commit_version: if succeeded { Some(2) } else { None },
            read_version_cached: false,
            succeeded,
        }
    }

    #[test]
    fn aggregates_successes_and_failures_separately() {
        let listener = AggregatingListener::new();
        listener.on_attempt(&metrics(true, 0));
        listener.on_attempt(&metrics(false, 1));
        listener.on_attempt(&metrics(true, 2));

        let snapshot = listener.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.total_retries, 3);
    }

    #[test]
    fn empty_snapshot_has_zeroed_averages() {
        let listener = AggregatingListener::new();
        let snapshot = listener.snapshot();
        assert_eq!(snapshot.attempts, 0);
        assert_eq!(snapshot.average_total_nanos, 0.0);
    }
}
