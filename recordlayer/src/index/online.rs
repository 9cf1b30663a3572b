//! The online (background, resumable) indexer.
//!
//! Builds one or several indexes over a type's records from a consistent starting point, in
//! bounded transactions, using the adaptive throttler to back off on contention and the
//! persistent range set to resume after a restart.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::codec::{self, Value};
use crate::error::{Error, Result};
use crate::index::descriptor::IndexDescriptor;
use crate::index::maintainer::IndexMaintainer;
use crate::index::rangeset::{RangeSet, RangeSetStore};
use crate::index::state::{IndexState, IndexStateManager};
use crate::kv::{next_key, Database};
use crate::storage::ItemStorage;
use crate::subspace::Subspace;
use crate::txn::throttle::{ThrottleConfig, Throttler};
use crate::violations::ViolationTracker;

/// Decodes a stored record's raw bytes into `(field name, value)` pairs, the same shape the
/// index maintainer consumes. Supplied by the caller, since the online indexer has no
/// compile-time knowledge of any particular [`crate::record::RecordType`].
pub type FieldDecoder = Arc<dyn Fn(&[u8]) -> Result<Vec<(String, Value)>> + Send + Sync>;

/// Configuration for one [`OnlineIndexer`] run.
#[derive(Clone)]
pub struct OnlineIndexConfig {
    /// A stable name for this build job, used as the range set's persistence key. Builds with
    /// the same job name resume each other's progress.
    pub job_name: String,
    /// Clears the target index subspace(s) before starting.
    pub clear_first: bool,
    pub throttle: ThrottleConfig,
}

/// Summarizes a completed online index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineIndexReport {
    pub records_processed: u64,
}

/// Builds one or more indexes over one record type's records.
pub struct OnlineIndexer {
    db: Arc<dyn Database>,
    type_name: String,
    record_subspace: Subspace,
    blobs_subspace: Subspace,
    targets: Vec<IndexDescriptor>,
    state: Arc<IndexStateManager>,
    maintainer: IndexMaintainer,
    violations: ViolationTracker,
    range_sets: RangeSetStore,
    item_storage: ItemStorage,
    throttler: Throttler,
    decode_fields: FieldDecoder,
    config: OnlineIndexConfig,
}

impl OnlineIndexer {
    /// Creates an indexer over `targets`, one or several indexes declared on `type_name`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        type_name: impl Into<String>,
        record_subspace: Subspace,
        blobs_subspace: Subspace,
        index_subspace: Subspace,
        meta_violations: Subspace,
        meta_range_set: Subspace,
        targets: Vec<IndexDescriptor>,
        state: Arc<IndexStateManager>,
        item_storage: ItemStorage,
        decode_fields: FieldDecoder,
        config: OnlineIndexConfig,
    ) -> Self {
        let throttler = Throttler::new(config.throttle);
        Self {
            db,
            type_name: type_name.into(),
            record_subspace,
            blobs_subspace,
            maintainer: IndexMaintainer::new(index_subspace, ViolationTracker::new(meta_violations.clone())),
            violations: ViolationTracker::new(meta_violations),
            range_sets: RangeSetStore::new(meta_range_set),
            item_storage,
            targets,
            state,
            throttler,
            decode_fields,
            config,
        }
    }

    /// Runs the build to completion, looping over bounded batches until the record range is
    /// exhausted, then promoting every target index to `readable`.
    pub async fn build(&self) -> Result<OnlineIndexReport> {
        if self.config.clear_first {
            let txn = self.db.create_transaction().await;
            for target in &self.targets {
                let (begin, end) = Subspace::new(self.maintainer.index_prefix(&target.name)).range();
                txn.clear_range(begin, end).await;
            }
            txn.commit().await?;
        }

        {
            let txn = self.db.create_transaction().await;
            for target in &self.targets {
                if self.state.state(txn.as_ref(), &target.name).await? == IndexState::Disabled {
                    self.state.enable(txn.as_ref(), &target.name).await?;
                }
            }
            txn.commit().await?;
        }

        {
            let txn = self.db.create_transaction().await;
            let mut set = self.range_sets.load(txn.as_ref(), &self.config.job_name).await?;
            if set.is_empty() {
                let (begin, end) = self.record_subspace.range();
                set = RangeSet::covering(begin, end);
                self.range_sets.save(txn.as_ref(), &self.config.job_name, &set).await?;
            }
            txn.commit().await?;
        }

        let mut records_processed = 0u64;
        loop {
            let batch_size = self.throttler.batch_size().max(1) as usize;
            match self.process_one_batch(batch_size).await {
                Ok(None) => break,
                Ok(Some(count)) => {
                    self.throttler.record_success();
                    records_processed += count as u64;
                }
                Err(err) if err.is_retryable() => {
                    self.throttler.record_failure();
                    tokio::time::sleep(Duration::from_millis(self.throttler.delay_ms())).await;
                }
                Err(err) => return Err(err),
            }
        }

        let txn = self.db.create_transaction().await;
        for target in &self.targets {
            if target.is_unique && self.violations.has_violations(txn.as_ref(), &target.name).await? {
                let summary = self.violations.violation_summary(txn.as_ref(), &target.name).await?;
                return Err(Error::UniquenessViolationsDetected {
                    index_name: target.name.clone(),
                    violation_count: summary.violation_count,
                    total_conflicting_records: summary.total_conflicting_records,
                });
            }
        }
        for target in &self.targets {
            self.state.make_readable(txn.as_ref(), &target.name).await?;
        }
        self.range_sets.clear(txn.as_ref(), &self.config.job_name).await?;
        txn.commit().await?;

        Ok(OnlineIndexReport { records_processed })
    }

    async fn process_one_batch(&self, batch_size: usize) -> Result<Option<usize>> {
        let txn = self.db.create_transaction().await;
        let mut set = self.range_sets.load(txn.as_ref(), &self.config.job_name).await?;
        let (begin, end) = match set.next_batch_bounds() {
            Some(bounds) => bounds,
            None => return Ok(None),
        };

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = txn
            .get_range(begin.clone(), end.clone(), true)
            .await?
            .take(batch_size)
            .collect();

        if pairs.is_empty() {
            set.mark_processed(begin, end);
            self.range_sets.save(txn.as_ref(), &self.config.job_name, &set).await?;
            txn.commit().await?;
            return Ok(Some(0));
        }

        let prefix_len = self.record_subspace.prefix().len();
        let mut last_key = pairs[0].0.clone();
        for (key, _) in &pairs {
            let pk = codec::unpack(&key[prefix_len..])?;
            let full = self
                .item_storage
                .read(txn.as_ref(), key, &self.blobs_subspace, &pk, false)
                .await?
                .ok_or_else(|| Error::malformed_tuple("record disappeared mid-scan"))?;
            let fields = (self.decode_fields)(&full)?;
            for target in &self.targets {
                self.maintainer
                    .apply(
                        txn.as_ref(),
                        &self.type_name,
                        target,
                        IndexState::WriteOnly,
                        None,
                        &[],
                        Some(&fields),
                        &pk,
                        SystemTime::now(),
                    )
                    .await?;
            }
            last_key = key.clone();
        }

        let processed_end = if pairs.len() < batch_size {
            end.clone()
        } else {
            next_key(&last_key)
        };
        set.mark_processed(begin, processed_end);
        self.range_sets.save(txn.as_ref(), &self.config.job_name, &set).await?;
        txn.commit().await?;
        Ok(Some(pairs.len()))
    }
}
