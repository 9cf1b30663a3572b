//! A single, process-wide cache of the most recently observed read and commit versions.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How a caller is willing to source a read version from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always obtain a fresh read version from the store; never consult the cache.
    Server,
    /// Accept any cached version regardless of age.
    Cached,
    /// Accept a cached version only if it was last updated within the given number of seconds.
    /// `Stale(0)` never hits.
    Stale(u64),
    /// Accept a cached version only if it is at least the given version.
    AtLeast(i64),
}

#[derive(Debug, Default)]
struct State {
    last_read_version: Option<i64>,
    last_commit_version: Option<i64>,
    last_updated_at: Option<Instant>,
    hit_count: u64,
    miss_count: u64,
}

impl State {
    fn cached_version(&self) -> Option<i64> {
        match (self.last_read_version, self.last_commit_version) {
            (Some(r), Some(c)) => Some(r.max(c)),
            (Some(r), None) => Some(r),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        }
    }
}

/// A monotonic, concurrency-safe cache of read/commit versions, consulted by the transaction
/// runner so repeated transactions under a relaxed cache policy can skip a round trip to obtain a
/// fresh read version.
#[derive(Debug, Default)]
pub struct ReadVersionCache {
    state: Mutex<State>,
}

impl ReadVersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly committed version. Ignored if not greater than the version already
    /// recorded (monotone non-decreasing).
    pub fn record_commit_version(&self, version: i64) {
        let mut state = self.state.lock().expect("read-version cache mutex poisoned");
        if state.last_commit_version.map_or(true, |v| version > v) {
            state.last_commit_version = Some(version);
            state.last_updated_at = Some(Instant::now());
        }
    }

    /// Records a freshly observed read version. Ignored if not greater than the version already
    /// recorded.
    pub fn update_read_version(&self, version: i64) {
        let mut state = self.state.lock().expect("read-version cache mutex poisoned");
        if state.last_read_version.map_or(true, |v| version > v) {
            state.last_read_version = Some(version);
            state.last_updated_at = Some(Instant::now());
        }
    }

    /// Returns a cached version satisfying `policy`, or `None` on a miss. Updates the hit/miss
    /// counters as a side effect.
    pub fn get_cached_version(&self, policy: CachePolicy) -> Option<i64> {
        let mut state = self.state.lock().expect("read-version cache mutex poisoned");
        let result = match policy {
            CachePolicy::Server => None,
            CachePolicy::Cached => state.cached_version(),
            CachePolicy::Stale(0) => None,
            CachePolicy::Stale(seconds) => match (state.cached_version(), state.last_updated_at) {
                (Some(v), Some(updated)) if updated.elapsed() <= Duration::from_secs(seconds) => Some(v),
                _ => None,
            },
            CachePolicy::AtLeast(minimum) => state.cached_version().filter(|v| *v >= minimum),
        };
        if result.is_some() {
            state.hit_count += 1;
        } else {
            state.miss_count += 1;
        }
        result
    }

    /// Clears all cached state; the next lookup is always a miss until a version is recorded
    /// again.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().expect("read-version cache mutex poisoned");
        state.last_read_version = None;
        state.last_commit_version = None;
        state.last_updated_at = None;
    }

    /// The number of lookups that returned a version, and the number that missed.
    pub fn hit_miss_counts(&self) -> (u64, u64) {
        let state = self.state.lock().expect("read-version cache mutex poisoned");
        (state.hit_count, state.miss_count)
    }
}
