//! The adaptive throttler: cooperative batch-size and delay feedback for long-running background
//! jobs such as the online indexer.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration for [`Throttler`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ThrottleConfig {
    pub initial_batch_size: u32,
    pub min_batch_size: u32,
    pub max_batch_size: u32,
    pub increase_ratio: f64,
    pub decrease_ratio: f64,
    pub successes_before_increase: u32,
    pub initial_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub delay_increase_ratio: f64,
    pub delay_decrease_ratio: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
            min_batch_size: 10,
            max_batch_size: 1000,
            increase_ratio: 1.5,
            decrease_ratio: 0.5,
            successes_before_increase: 5,
            initial_delay_ms: 0,
            min_delay_ms: 0,
            max_delay_ms: 5_000,
            delay_increase_ratio: 2.0,
            delay_decrease_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    batch_size: f64,
    delay_ms: f64,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
}

/// Cooperative adaptive batch-size/delay control for background jobs driving a KV store near its
/// capacity limits.
pub struct Throttler {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl Throttler {
    /// Creates a throttler at its configured initial batch size and delay.
    pub fn new(config: ThrottleConfig) -> Self {
        let state = ThrottleState {
            batch_size: config.initial_batch_size as f64,
            delay_ms: config.initial_delay_ms as f64,
            consecutive_successes: 0,
            total_successes: 0,
            total_failures: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// The current recommended batch size.
    pub fn batch_size(&self) -> u32 {
        self.state.lock().unwrap().batch_size.round() as u32
    }

    /// The current recommended delay, in milliseconds, before the next attempt.
    pub fn delay_ms(&self) -> u64 {
        self.state.lock().unwrap().delay_ms.round() as u64
    }

    /// Records a successful batch. Every [`ThrottleConfig::successes_before_increase`]
    /// consecutive successes, the batch size grows by `increaseRatio` and the delay shrinks by
    /// `delayDecreaseRatio`, both clamped to their configured bounds.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.total_successes += 1;
        state.consecutive_successes += 1;
        if state.consecutive_successes >= self.config.successes_before_increase {
            state.batch_size = (state.batch_size * self.config.increase_ratio)
                .min(self.config.max_batch_size as f64);
            state.delay_ms = (state.delay_ms * self.config.delay_decrease_ratio)
                .max(self.config.min_delay_ms as f64);
            state.consecutive_successes = 0;
        }
    }

    /// Records a failed batch. The batch size shrinks by `decreaseRatio` and the delay grows by
    /// `delayIncreaseRatio`, both clamped to their configured bounds; the consecutive-success
    /// streak resets.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.total_failures += 1;
        state.consecutive_successes = 0;
        state.batch_size = (state.batch_size * self.config.decrease_ratio)
            .max(self.config.min_batch_size as f64);
        state.delay_ms = (state.delay_ms * self.config.delay_increase_ratio)
            .min(self.config.max_delay_ms as f64);
    }

    /// Total successful and failed batches recorded so far.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.total_successes, state.total_failures)
    }

    /// Whether `error` is one of the transient KV-store errors this throttler reacts to.
    pub fn is_retryable(error: &Error) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_failures_halve_batch_size_and_clamp_to_minimum() {
        let throttler = Throttler::new(ThrottleConfig {
            initial_batch_size: 100,
            min_batch_size: 10,
            decrease_ratio: 0.5,
            ..ThrottleConfig::default()
        });
        throttler.record_failure();
        assert_eq!(throttler.batch_size(), 50);
        throttler.record_failure();
        assert_eq!(throttler.batch_size(), 25);
        throttler.record_failure();
        assert_eq!(throttler.batch_size(), 13);
        throttler.record_failure();
        assert_eq!(throttler.batch_size(), 10);
    }

    #[test]
    fn batch_size_grows_only_after_enough_consecutive_successes() {
        let throttler = Throttler::new(ThrottleConfig {
            initial_batch_size: 100,
            successes_before_increase: 3,
            increase_ratio: 2.0,
            max_batch_size: 1000,
            ..ThrottleConfig::default()
        });
        throttler.record_success();
        throttler.record_success();
        assert_eq!(throttler.batch_size(), 100);
        throttler.record_success();
        assert_eq!(throttler.batch_size(), 200);
    }

    #[test]
    fn a_failure_resets_the_consecutive_success_streak() {
        let throttler = Throttler::new(ThrottleConfig {
            initial_batch_size: 100,
            successes_before_increase: 2,
            increase_ratio: 2.0,
            ..ThrottleConfig::default()
        });
        throttler.record_success();
        throttler.record_failure();
        throttler.record_success();
        assert_eq!(throttler.batch_size(), 50);
    }
}
