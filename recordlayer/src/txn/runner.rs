//! The transaction runner: applies configuration, runs `body` against a fresh transaction handle,
//! retries on transient failure with exponential backoff and full jitter, and commits.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::error::{Error, Result};
use crate::kv::{Database, Priority, ReadPriority, Transaction, TxnOption};
use crate::metrics::{AttemptMetrics, RunnerListener};
use crate::txn::read_version_cache::{CachePolicy, ReadVersionCache};

/// Configuration applied to every transaction attempt the runner makes.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub priority: Priority,
    pub read_priority: ReadPriority,
    pub timeout_ms: Option<u64>,
    pub retry_limit: u32,
    pub base_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub read_cache_disable: bool,
    pub debug_identifier: Option<String>,
    pub tags: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Default,
            read_priority: ReadPriority::Normal,
            timeout_ms: Some(5_000),
            retry_limit: 10,
            base_delay_ms: 10,
            max_retry_delay_ms: 1_000,
            read_cache_disable: false,
            debug_identifier: None,
            tags: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Read-only workloads: no write-related timeout pressure, a slightly longer retry budget.
    pub fn read_only() -> Self {
        Self {
            priority: Priority::Default,
            read_priority: ReadPriority::Normal,
            timeout_ms: Some(10_000),
            retry_limit: 10,
            ..Self::default()
        }
    }

    /// Bulk/background work: batch priority, large retry budget, tolerant of long delays.
    pub fn batch() -> Self {
        Self {
            priority: Priority::Batch,
            read_priority: ReadPriority::Low,
            timeout_ms: Some(60_000),
            retry_limit: 50,
            base_delay_ms: 50,
            max_retry_delay_ms: 5_000,
            ..Self::default()
        }
    }

    /// Internal maintenance (online indexing, migrations): system priority, large retry budget.
    pub fn system() -> Self {
        Self {
            priority: Priority::System,
            read_priority: ReadPriority::Normal,
            timeout_ms: Some(60_000),
            retry_limit: 100,
            base_delay_ms: 20,
            max_retry_delay_ms: 2_000,
            ..Self::default()
        }
    }

    /// Latency-sensitive foreground work: short timeout, small retry budget, short backoff.
    pub fn interactive() -> Self {
        Self {
            priority: Priority::Default,
            read_priority: ReadPriority::High,
            timeout_ms: Some(1_000),
            retry_limit: 3,
            base_delay_ms: 5,
            max_retry_delay_ms: 100,
            ..Self::default()
        }
    }

    /// Long scans and reports: no timeout pressure, large retry budget, long maximum backoff.
    pub fn long_running() -> Self {
        Self {
            priority: Priority::Batch,
            read_priority: ReadPriority::Low,
            timeout_ms: None,
            retry_limit: 200,
            base_delay_ms: 100,
            max_retry_delay_ms: 30_000,
            ..Self::default()
        }
    }
}

/// The deterministic half of the backoff delay for a given attempt: `min(maxDelayMs,
/// baseDelayMs·2^attempt)`. The runner adds a uniform random jitter in `[0, 0.5·deterministic)`
/// on top (full jitter, upper half) before sleeping.
pub fn calculate_backoff(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let scaled = base_delay_ms.saturating_mul(1u64 << attempt.min(32));
    scaled.min(max_delay_ms)
}

fn apply_options(txn: &dyn Transaction, config: &RunnerConfig) {
    txn.set_option(TxnOption::Priority(config.priority));
    txn.set_option(TxnOption::ReadPriority(config.read_priority));
    if let Some(timeout_ms) = config.timeout_ms {
        txn.set_option(TxnOption::TimeoutMs(timeout_ms));
    }
    txn.set_option(TxnOption::RetryLimit(config.retry_limit));
    txn.set_option(TxnOption::MaxRetryDelayMs(config.max_retry_delay_ms));
    if config.read_cache_disable {
        txn.set_option(TxnOption::ReadCacheDisable);
    }
    if let Some(debug_identifier) = &config.debug_identifier {
        txn.set_option(TxnOption::DebugIdentifier(debug_identifier.clone()));
    }
    for tag in &config.tags {
        txn.set_option(TxnOption::Tag(tag.clone()));
    }
}

/// Runs `body` against a transaction obtained from `db`, retrying transient failures under
/// `config`'s backoff and retry-limit policy. `cache`/`cache_policy` are optional: when both are
/// given, a cache hit skips the round trip to obtain a fresh read version and a successful commit
/// feeds the cache back.
pub async fn run<F, Fut, T>(
    db: &dyn Database,
    config: &RunnerConfig,
    listeners: &[Arc<dyn RunnerListener>],
    cache: Option<&ReadVersionCache>,
    cache_policy: Option<CachePolicy>,
    body: F,
) -> Result<T>
where
    F: Fn(Arc<dyn Transaction>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let attempt_start = Instant::now();
        let txn = db.create_transaction().await;
        apply_options(txn.as_ref(), config);

        let read_version_start = Instant::now();
        let cached_version = cache.and_then(|c| cache_policy.and_then(|p| c.get_cached_version(p)));
        let read_version_cached = cached_version.is_some();
        let read_version_result = match cached_version {
            Some(v) => {
                txn.set_read_version(v).await;
                Ok(v)
            }
            None => txn.get_read_version().await,
        };
        let user_code_start = Instant::now();

        let read_version = match read_version_result {
            Ok(v) => {
                if cached_version.is_none() {
                    if let Some(c) = cache {
                        c.update_read_version(v);
                    }
                }
                v
            }
            Err(err) => {
                notify(
                    listeners,
                    attempt,
                    attempt_start,
                    read_version_start,
                    user_code_start,
                    user_code_start,
                    None,
                    None,
                    read_version_cached,
                    false,
                );
                if !err.is_retryable() || attempt >= config.retry_limit {
                    return Err(err);
                }
                sleep_backoff(attempt, config).await;
                attempt += 1;
                continue;
            }
        };

        let body_result = body(Arc::clone(&txn)).await;

        let value = match body_result {
            Ok(v) => v,
            Err(err) => {
                notify(
                    listeners,
                    attempt,
                    attempt_start,
                    read_version_start,
                    user_code_start,
                    user_code_start,
                    Some(read_version),
                    None,
                    read_version_cached,
                    false,
                );
                if !err.is_retryable() || attempt >= config.retry_limit {
                    return Err(err);
                }
                sleep_backoff(attempt, config).await;
                attempt += 1;
                continue;
            }
        };

        let commit_start = Instant::now();
        let commit_result = txn.commit().await;

        match commit_result {
            Ok(commit_version) => {
                if let Some(c) = cache {
                    c.record_commit_version(commit_version);
                }
                notify(
                    listeners,
                    attempt,
                    attempt_start,
                    read_version_start,
                    user_code_start,
                    commit_start,
                    Some(read_version),
                    Some(commit_version),
                    read_version_cached,
                    true,
                );
                return Ok(value);
            }
            Err(err) => {
                notify(
                    listeners,
                    attempt,
                    attempt_start,
                    read_version_start,
                    user_code_start,
                    commit_start,
                    Some(read_version),
                    None,
                    read_version_cached,
                    false,
                );
                if !err.is_retryable() || attempt >= config.retry_limit {
                    return Err(err);
                }
                sleep_backoff(attempt, config).await;
                attempt += 1;
                continue;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn notify(
    listeners: &[Arc<dyn RunnerListener>],
    retry_count: u32,
    attempt_start: Instant,
    read_version_start: Instant,
    user_code_start: Instant,
    commit_start: Instant,
    read_version: Option<i64>,
    commit_version: Option<i64>,
    read_version_cached: bool,
    succeeded: bool,
) {
    let metrics = AttemptMetrics {
        total_nanos: attempt_start.elapsed().as_nanos() as u64,
        get_read_version_nanos: (user_code_start - read_version_start).as_nanos() as u64,
        user_code_nanos: (commit_start - user_code_start).as_nanos() as u64,
        commit_nanos: commit_start.elapsed().as_nanos() as u64,
        retry_count,
        read_version,
        commit_version,
        read_version_cached,
        succeeded,
    };
    for listener in listeners {
        listener.on_attempt(&metrics);
    }
}

/// Sleeps for the exponential-backoff-with-full-jitter delay for `attempt`.
async fn sleep_backoff(attempt: u32, config: &RunnerConfig) {
    let deterministic = calculate_backoff(attempt, config.base_delay_ms, config.max_retry_delay_ms);
    let jitter = if deterministic == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=(deterministic / 2))
    };
    tokio::time::sleep(std::time::Duration::from_millis(deterministic + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::TestDatabase;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_attempt_with_no_conflicts() {
        let db = TestDatabase::new();
        let config = RunnerConfig::default();
        let result = run(&db, &config, &[], None, None, |txn| async move {
            txn.set(b"k".to_vec(), b"v".to_vec()).await;
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn retries_past_a_real_conflict_then_succeeds() {
        let db = TestDatabase::new();
        let mut config = RunnerConfig::default();
        config.base_delay_ms = 1;
        config.max_retry_delay_ms = 2;
        let attempts = AtomicU32::new(0);
        let triggered = AtomicBool::new(false);
        let result = run(&db, &config, &[], None, None, |txn| {
            let attempts = &attempts;
            let triggered = &triggered;
            let db = &db;
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                let _ = txn.get(b"k", false).await?;
                if n == 0 && !triggered.swap(true, Ordering::SeqCst) {
                    // A concurrent writer commits between this attempt's read and its commit,
                    // forcing a genuine optimistic-concurrency conflict on retry.
                    let other = db.create_transaction().await;
                    other.set(b"k".to_vec(), b"external".to_vec()).await;
                    other.commit().await.unwrap();
                }
                txn.set(b"k2".to_vec(), b"v".to_vec()).await;
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_is_deterministic_and_clamped() {
        assert_eq!(calculate_backoff(0, 10, 1000), 10);
        assert_eq!(calculate_backoff(1, 10, 1000), 20);
        assert_eq!(calculate_backoff(2, 10, 1000), 40);
        assert_eq!(calculate_backoff(10, 10, 1000), 1000);
    }

    #[test]
    fn preset_configs_differ_in_retry_budget() {
        assert!(RunnerConfig::interactive().retry_limit < RunnerConfig::batch().retry_limit);
        assert!(RunnerConfig::system().retry_limit > RunnerConfig::default().retry_limit);
    }
}
