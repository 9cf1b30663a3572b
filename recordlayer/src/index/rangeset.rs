//! The persistent range set: a disjoint set of unprocessed half-open byte ranges that lets the
//! online indexer resume a background build after a restart.

use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// A disjoint, sorted set of half-open `[begin, end)` byte ranges still awaiting processing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl RangeSet {
    /// An empty range set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A range set covering exactly one initial range, e.g. a type's whole record subspace at
    /// the start of an online build.
    pub fn covering(begin: Vec<u8>, end: Vec<u8>) -> Self {
        let mut set = Self::new();
        set.insert_range(begin, end);
        set
    }

    /// Adds `[begin, end)`, merging with any overlapping or adjacent existing ranges.
    pub fn insert_range(&mut self, begin: Vec<u8>, end: Vec<u8>) {
        if begin >= end {
            return;
        }
        self.ranges.push((begin, end));
        self.ranges.sort();
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.ranges.len());
        for (begin, end) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some((_, last_end)) if begin <= *last_end => {
                    if end > *last_end {
                        *last_end = end;
                    }
                }
                _ => merged.push((begin, end)),
            }
        }
        self.ranges = merged;
    }

    /// Returns the lex-smallest unprocessed range, if any.
    pub fn next_batch_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.ranges.first().cloned()
    }

    /// Subtracts `[begin, end)` from the set, splitting any range it partially overlaps.
    pub fn mark_processed(&mut self, begin: Vec<u8>, end: Vec<u8>) {
        let mut remaining = Vec::with_capacity(self.ranges.len() + 1);
        for (range_begin, range_end) in self.ranges.drain(..) {
            if range_end <= begin || range_begin >= end {
                remaining.push((range_begin, range_end));
                continue;
            }
            if range_begin < begin {
                remaining.push((range_begin, begin.clone()));
            }
            if range_end > end {
                remaining.push((end.clone(), range_end));
            }
        }
        remaining.sort();
        self.ranges = remaining;
    }

    /// Returns `true` if no range remains.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Serializes the set into a stable, restart-safe byte encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|err| Error::malformed_tuple(err.to_string()))
    }

    /// Deserializes a set previously produced by [`RangeSet::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|err| Error::malformed_tuple(err.to_string()))
    }
}

/// Persists [`RangeSet`]s under `S._meta.rangeSet.<jobName>`.
pub struct RangeSetStore {
    meta: Subspace,
}

impl RangeSetStore {
    /// Creates a store persisting under the given `_meta.rangeSet` subspace.
    pub fn new(meta: Subspace) -> Self {
        Self { meta }
    }

    fn key(&self, job_name: &str) -> Vec<u8> {
        self.meta.pack(&[Value::Str(job_name.to_string())])
    }

    /// Loads the range set for `job_name`, or an empty one if none has been persisted yet.
    pub async fn load(&self, txn: &dyn Transaction, job_name: &str) -> Result<RangeSet> {
        match txn.get(&self.key(job_name), false).await? {
            Some(bytes) => RangeSet::decode(&bytes),
            None => Ok(RangeSet::new()),
        }
    }

    /// Persists `set` for `job_name`.
    pub async fn save(&self, txn: &dyn Transaction, job_name: &str, set: &RangeSet) -> Result<()> {
        txn.set(self.key(job_name), set.encode()?).await;
        Ok(())
    }

    /// Removes the persisted range set for `job_name`, e.g. after a build completes.
    pub async fn clear(&self, txn: &dyn Transaction, job_name: &str) -> Result<()> {
        txn.clear(self.key(job_name)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Database, TestDatabase};

    #[test]
    fn mark_processed_splits_a_middle_range() {
        let mut set = RangeSet::covering(vec![0], vec![100]);
        set.mark_processed(vec![30], vec![60]);
        assert_eq!(
            set.next_batch_bounds(),
            Some((vec![0], vec![30]))
        );
        set.mark_processed(vec![0], vec![30]);
        assert_eq!(set.next_batch_bounds(), Some((vec![60], vec![100])));
        set.mark_processed(vec![60], vec![100]);
        assert!(set.is_empty());
    }

    #[test]
    fn insert_range_merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        set.insert_range(vec![0], vec![10]);
        set.insert_range(vec![10], vec![20]);
        set.insert_range(vec![25], vec![30]);
        set.insert_range(vec![18], vec![26]);
        assert_eq!(set.next_batch_bounds(), Some((vec![0], vec![30])));
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut set = RangeSet::new();
        set.insert_range(vec![1, 2], vec![9, 9]);
        let bytes = set.encode().unwrap();
        let decoded = RangeSet::decode(&bytes).unwrap();
        assert_eq!(set, decoded);
    }

    #[tokio::test]
    async fn store_round_trips_through_a_transaction() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let store = RangeSetStore::new(Subspace::new(b"meta.rangeSet.".to_vec()));
        let set = RangeSet::covering(vec![0], vec![255]);
        store.save(txn.as_ref(), "User_email_build", &set).await.unwrap();
        let loaded = store.load(txn.as_ref(), "User_email_build").await.unwrap();
        assert_eq!(loaded, set);
        store.clear(txn.as_ref(), "User_email_build").await.unwrap();
        assert!(store.load(txn.as_ref(), "User_email_build").await.unwrap().is_empty());
    }
}
