//! The uniqueness-violation tracker.
//!
//! Violations recorded while a unique index is in `writeOnly` state (see
//! [`crate::index::maintainer::IndexMaintainer`]) are persisted here so an operator can inspect
//! them before promoting the index to `readable`.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::codec::{Tuple, Value};
use crate::error::Result;
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// One recorded uniqueness conflict: several primary keys claiming the same index value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniquenessViolation {
    pub index_name: String,
    pub type_name: String,
    pub value_key: Tuple,
    pub primary_keys: Vec<Tuple>,
    pub detected_at: SystemTime,
}

/// A rollup of an index's recorded violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationSummary {
    pub violation_count: usize,
    pub total_conflicting_records: usize,
}

/// Persists and enumerates uniqueness violations under `S._meta.violations`.
pub struct ViolationTracker {
    meta: Subspace,
}

impl ViolationTracker {
    /// Creates a tracker persisting under the given `_meta.violations` subspace.
    pub fn new(meta: Subspace) -> Self {
        Self { meta }
    }

    fn key(&self, index_name: &str, value_key: &[Value]) -> Vec<u8> {
        self.meta.pack(&[
            Value::Str(index_name.to_string()),
            Value::Tuple(value_key.to_vec()),
        ])
    }

    fn index_range(&self, index_name: &str) -> (Vec<u8>, Vec<u8>) {
        let prefix = self.meta.pack(&[Value::Str(index_name.to_string())]);
        Subspace::new(prefix).range()
    }

    /// Appends `new_pk` to the set of conflicting primary keys recorded for `value_key`, creating
    /// the record if it doesn't exist yet.
    pub async fn record_violation(
        &self,
        txn: &dyn Transaction,
        index_name: &str,
        type_name: &str,
        value_key: &[Value],
        existing_pk: Tuple,
        new_pk: Tuple,
        detected_at: SystemTime,
    ) -> Result<()> {
        let key = self.key(index_name, value_key);
        let mut violation = match txn.get(&key, false).await? {
            Some(bytes) => bincode::deserialize::<UniquenessViolation>(&bytes)
                .map_err(|err| crate::error::Error::malformed_tuple(err.to_string()))?,
            None => UniquenessViolation {
                index_name: index_name.to_string(),
                type_name: type_name.to_string(),
                value_key: value_key.to_vec(),
                primary_keys: vec![existing_pk],
                detected_at,
            },
        };
        if !violation.primary_keys.contains(&new_pk) {
            violation.primary_keys.push(new_pk);
        }
        let bytes = bincode::serialize(&violation)
            .map_err(|err| crate::error::Error::malformed_tuple(err.to_string()))?;
        txn.set(key, bytes).await;
        Ok(())
    }

    /// Lists every violation recorded for `index_name`.
    pub async fn scan_violations(
        &self,
        txn: &dyn Transaction,
        index_name: &str,
    ) -> Result<Vec<UniquenessViolation>> {
        let (begin, end) = self.index_range(index_name);
        let mut out = Vec::new();
        for (_, value) in txn.get_range(begin, end, true).await? {
            out.push(
                bincode::deserialize::<UniquenessViolation>(&value)
                    .map_err(|err| crate::error::Error::malformed_tuple(err.to_string()))?,
            );
        }
        Ok(out)
    }

    /// Returns `true` if `index_name` has any recorded violation.
    pub async fn has_violations(&self, txn: &dyn Transaction, index_name: &str) -> Result<bool> {
        Ok(!self.scan_violations(txn, index_name).await?.is_empty())
    }

    /// Returns the number of distinct value keys with recorded violations for `index_name`.
    pub async fn count_violations(&self, txn: &dyn Transaction, index_name: &str) -> Result<usize> {
        Ok(self.scan_violations(txn, index_name).await?.len())
    }

    /// Clears the violation recorded for a specific value key, if any.
    pub async fn clear_violation(
        &self,
        txn: &dyn Transaction,
        index_name: &str,
        value_key: &[Value],
    ) -> Result<()> {
        txn.clear(self.key(index_name, value_key)).await;
        Ok(())
    }

    /// Clears every violation recorded for `index_name`.
    pub async fn clear_all_violations(&self, txn: &dyn Transaction, index_name: &str) -> Result<()> {
        let (begin, end) = self.index_range(index_name);
        txn.clear_range(begin, end).await;
        Ok(())
    }

    /// Summarizes an index's recorded violations.
    pub async fn violation_summary(
        &self,
        txn: &dyn Transaction,
        index_name: &str,
    ) -> Result<ViolationSummary> {
        let violations = self.scan_violations(txn, index_name).await?;
        let total_conflicting_records = violations.iter().map(|v| v.primary_keys.len()).sum();
        Ok(ViolationSummary {
            violation_count: violations.len(),
            total_conflicting_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Database, TestDatabase};

    fn tracker() -> ViolationTracker {
        ViolationTracker::new(Subspace::new(b"meta.violations.".to_vec()))
    }

    #[tokio::test]
    async fn records_and_accumulates_conflicting_primary_keys() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let tracker = tracker();
        let value_key = vec![Value::Str("a@x".into())];
        let now = SystemTime::now();

        tracker
            .record_violation(
                txn.as_ref(),
                "User_email",
                "User",
                &value_key,
                vec![Value::Str("U1".into())],
                vec![Value::Str("U2".into())],
                now,
            )
            .await
            .unwrap();
        tracker
            .record_violation(
                txn.as_ref(),
                "User_email",
                "User",
                &value_key,
                vec![Value::Str("U1".into())],
                vec![Value::Str("U3".into())],
                now,
            )
            .await
            .unwrap();

        let violations = tracker.scan_violations(txn.as_ref(), "User_email").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].primary_keys.len(), 3);

        let summary = tracker.violation_summary(txn.as_ref(), "User_email").await.unwrap();
        assert_eq!(summary.violation_count, 1);
        assert_eq!(summary.total_conflicting_records, 3);
    }

    #[tokio::test]
    async fn clear_violation_removes_it() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let tracker = tracker();
        let value_key = vec![Value::Str("a@x".into())];
        tracker
            .record_violation(
                txn.as_ref(),
                "idx",
                "T",
                &value_key,
                vec![Value::Str("A".into())],
                vec![Value::Str("B".into())],
                SystemTime::now(),
            )
            .await
            .unwrap();
        assert!(tracker.has_violations(txn.as_ref(), "idx").await.unwrap());
        tracker.clear_violation(txn.as_ref(), "idx", &value_key).await.unwrap();
        assert!(!tracker.has_violations(txn.as_ref(), "idx").await.unwrap());
    }
}
