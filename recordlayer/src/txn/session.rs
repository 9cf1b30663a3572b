//! A cooperative, heartbeat-renewed lease used to serialize exclusive background work (e.g. an
//! online index build) across process instances sharing one store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::kv::Database;
use crate::subspace::Subspace;

/// Configuration for one named lock.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub session_name: String,
    pub lock_timeout_seconds: u64,
    pub renewal_interval_seconds: u64,
    /// If `true`, a holder whose last heartbeat is older than `stale_threshold_seconds` may be
    /// displaced even before its lease formally expires.
    pub allow_lock_stealing: bool,
    pub stale_threshold_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            session_name: "default".to_string(),
            lock_timeout_seconds: 30,
            renewal_interval_seconds: 10,
            allow_lock_stealing: false,
            stale_threshold_seconds: 60,
        }
    }
}

/// The persisted lease record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub session_id: String,
    pub session_name: String,
    pub acquired_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub expires_at: SystemTime,
}

/// A session lock over a well-known key, with background heartbeat renewal.
pub struct SessionLock {
    db: Arc<dyn Database>,
    meta: Subspace,
    config: SessionConfig,
    held: Arc<AtomicBool>,
    heartbeat_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionLock {
    pub fn new(db: Arc<dyn Database>, meta: Subspace, config: SessionConfig) -> Self {
        Self {
            db,
            meta,
            config,
            held: Arc::new(AtomicBool::new(false)),
            heartbeat_task: std::sync::Mutex::new(None),
        }
    }

    fn key(&self) -> Vec<u8> {
        self.meta.pack(&[Value::Str(self.config.session_name.clone())])
    }

    async fn read_holder(&self) -> Result<Option<LockHolder>> {
        let txn = self.db.create_transaction().await;
        match txn.get(&self.key(), false).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(|err| {
                Error::InvalidLockData {
                    session_name: self.config.session_name.clone(),
                    reason: err.to_string(),
                }
            })?)),
            None => Ok(None),
        }
    }

    fn can_acquire(&self, existing: &Option<LockHolder>, now: SystemTime) -> bool {
        match existing {
            None => true,
            Some(holder) => {
                if holder.expires_at <= now {
                    return true;
                }
                if self.config.allow_lock_stealing {
                    let stale_threshold = Duration::from_secs(self.config.stale_threshold_seconds);
                    if let Ok(age) = now.duration_since(holder.last_heartbeat) {
                        return age >= stale_threshold;
                    }
                }
                false
            }
        }
    }

    /// Attempts to acquire the lease, writing a new [`LockHolder`] atomically if the current
    /// holder is absent, expired, or (when configured) stale. Starts a background renewal task on
    /// success.
    pub async fn acquire(self: &Arc<Self>) -> Result<()> {
        let now = SystemTime::now();
        let existing = self.read_holder().await?;
        if !self.can_acquire(&existing, now) {
            return Err(Error::LockNotAcquired {
                session_name: self.config.session_name.clone(),
            });
        }

        let holder = LockHolder {
            session_id: self.config.session_id.clone(),
            session_name: self.config.session_name.clone(),
            acquired_at: now,
            last_heartbeat: now,
            expires_at: now + Duration::from_secs(self.config.lock_timeout_seconds),
        };
        let bytes = bincode::serialize(&holder).map_err(|err| Error::InvalidLockData {
            session_name: self.config.session_name.clone(),
            reason: err.to_string(),
        })?;
        let txn = self.db.create_transaction().await;
        txn.set(self.key(), bytes).await;
        txn.commit().await?;

        self.held.store(true, Ordering::SeqCst);
        self.spawn_heartbeat();
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let lock = Arc::clone(self);
        let interval = Duration::from_secs(self.config.renewal_interval_seconds.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !lock.held.load(Ordering::SeqCst) {
                    return;
                }
                if lock.renew().await.is_err() {
                    lock.held.store(false, Ordering::SeqCst);
                    return;
                }
            }
        });
        *self.heartbeat_task.lock().expect("session lock mutex poisoned") = Some(handle);
    }

    /// Refreshes `lastHeartbeat`/`expiresAt` if this session still owns the lease; fails with
    /// [`Error::LockLost`] otherwise.
    pub async fn renew(&self) -> Result<()> {
        let now = SystemTime::now();
        let existing = self.read_holder().await?;
        match existing {
            Some(holder) if holder.session_id == self.config.session_id => {
                let renewed = LockHolder {
                    last_heartbeat: now,
                    expires_at: now + Duration::from_secs(self.config.lock_timeout_seconds),
                    ..holder
                };
                let bytes = bincode::serialize(&renewed).map_err(|err| Error::InvalidLockData {
                    session_name: self.config.session_name.clone(),
                    reason: err.to_string(),
                })?;
                let txn = self.db.create_transaction().await;
                txn.set(self.key(), bytes).await;
                txn.commit().await?;
                Ok(())
            }
            _ => Err(Error::LockLost {
                session_name: self.config.session_name.clone(),
            }),
        }
    }

    /// Clears the lease if still owned by this session, and stops the background renewal task.
    pub async fn release(&self) -> Result<()> {
        self.held.store(false, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat_task.lock().expect("session lock mutex poisoned").take() {
            handle.abort();
        }
        let existing = self.read_holder().await?;
        if let Some(holder) = existing {
            if holder.session_id == self.config.session_id {
                let txn = self.db.create_transaction().await;
                txn.clear(self.key()).await;
                txn.commit().await?;
            }
        }
        Ok(())
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::TestDatabase;

    fn config(session_id: &str) -> SessionConfig {
        SessionConfig {
            session_id: session_id.to_string(),
            session_name: "indexBuild".to_string(),
            lock_timeout_seconds: 30,
            renewal_interval_seconds: 3600,
            allow_lock_stealing: false,
            stale_threshold_seconds: 60,
        }
    }

    #[tokio::test]
    async fn a_second_session_cannot_acquire_a_live_lock() {
        let db: Arc<dyn Database> = Arc::new(TestDatabase::new());
        let meta = Subspace::new(b"meta.lock.".to_vec());
        let first = Arc::new(SessionLock::new(Arc::clone(&db), meta.clone(), config("s1")));
        first.acquire().await.unwrap();

        let second = Arc::new(SessionLock::new(Arc::clone(&db), meta, config("s2")));
        let err = second.acquire().await.unwrap_err();
        assert!(matches!(err, Error::LockNotAcquired { .. }));
        first.release().await.unwrap();
    }

    #[tokio::test]
    async fn renew_fails_once_another_session_has_stolen_the_lock() {
        let db: Arc<dyn Database> = Arc::new(TestDatabase::new());
        let meta = Subspace::new(b"meta.lock.".to_vec());
        let mut stealable = config("s1");
        stealable.lock_timeout_seconds = 0;
        let first = Arc::new(SessionLock::new(Arc::clone(&db), meta.clone(), stealable));
        first.acquire().await.unwrap();

        let mut stealer_config = config("s2");
        stealer_config.allow_lock_stealing = true;
        stealer_config.stale_threshold_seconds = 0;
        let stealer = Arc::new(SessionLock::new(Arc::clone(&db), meta, stealer_config));
        // The first lease already expired (timeout 0), so the stealer can acquire outright.
        stealer.acquire().await.unwrap();

        let err = first.renew().await.unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));
        stealer.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_clears_the_lease_for_the_next_acquirer() {
        let db: Arc<dyn Database> = Arc::new(TestDatabase::new());
        let meta = Subspace::new(b"meta.lock.".to_vec());
        let first = Arc::new(SessionLock::new(Arc::clone(&db), meta.clone(), config("s1")));
        first.acquire().await.unwrap();
        first.release().await.unwrap();

        let second = Arc::new(SessionLock::new(Arc::clone(&db), meta, config("s2")));
        assert!(second.acquire().await.is_ok());
        second.release().await.unwrap();
    }
}
