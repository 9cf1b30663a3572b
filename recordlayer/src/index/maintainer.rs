//! The diff-based index maintainer.
//!
//! Given a record's fields before and after a write, only the symmetric difference of the old
//! and new index key sets is touched — the maintainer never scans a whole index to apply one
//! record's update.

use std::time::SystemTime;

use crate::codec::{self, Tuple, Value};
use crate::error::{Error, Result};
use crate::index::descriptor::{IndexDescriptor, UniquenessCheckMode};
use crate::index::state::IndexState;
use crate::kv::Transaction;
use crate::record::RecordEncoder;
use crate::subspace::Subspace;
use crate::violations::ViolationTracker;

/// Maintains secondary index entries under `S.I` for one record type.
pub struct IndexMaintainer {
    index_subspace: Subspace,
    violations: ViolationTracker,
}

impl IndexMaintainer {
    /// Creates a maintainer writing entries under the given `S.I` subspace, recording violations
    /// through `violations`.
    pub fn new(index_subspace: Subspace, violations: ViolationTracker) -> Self {
        Self {
            index_subspace,
            violations,
        }
    }

    fn entry_key(&self, index_name: &str, key: &[Value], pk: &[Value]) -> Vec<u8> {
        self.index_subspace.pack(&[
            Value::Str(index_name.to_string()),
            Value::Tuple(key.to_vec()),
            Value::Tuple(pk.to_vec()),
        ])
    }

    fn key_prefix(&self, index_name: &str, key: &[Value]) -> Vec<u8> {
        self.index_subspace
            .pack(&[Value::Str(index_name.to_string()), Value::Tuple(key.to_vec())])
    }

    /// The prefix covering every entry of `index_name`, regardless of index key or primary key;
    /// used to clear a whole index's subspace before a `clearFirst` online build.
    pub fn index_prefix(&self, index_name: &str) -> Vec<u8> {
        self.index_subspace.pack(&[Value::Str(index_name.to_string())])
    }

    /// Applies one record's diff to one index. `old_fields`/`new_fields` are `None` for an
    /// insert/delete respectively; both `Some` for an update. `state` must be `writeOnly` or
    /// `readable` — callers are expected to skip `disabled` indexes entirely.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        &self,
        txn: &dyn Transaction,
        type_name: &str,
        descriptor: &IndexDescriptor,
        state: IndexState,
        old_fields: Option<&[(String, Value)]>,
        old_pk: &[Value],
        new_fields: Option<&[(String, Value)]>,
        new_pk: &[Value],
        now: SystemTime,
    ) -> Result<()> {
        let old_keys: Vec<Tuple> = old_fields.map(|f| descriptor.index_keys(f)).unwrap_or_default();
        let new_keys: Vec<Tuple> = new_fields.map(|f| descriptor.index_keys(f)).unwrap_or_default();

        for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
            txn.clear(self.entry_key(&descriptor.name, key, old_pk)).await;
        }

        for key in new_keys.iter().filter(|k| !old_keys.contains(k)) {
            if descriptor.is_unique {
                self.enforce_uniqueness(txn, type_name, descriptor, state, key, new_pk, now)
                    .await?;
            }
            let value = if descriptor.covering_fields.is_empty() {
                Vec::new()
            } else {
                let covering: Vec<&str> = descriptor.covering_fields.iter().map(String::as_str).collect();
                RecordEncoder::encode_covering(&covering, new_fields.unwrap_or(&[]))
            };
            txn.set(self.entry_key(&descriptor.name, key, new_pk), value).await;
        }
        Ok(())
    }

    async fn enforce_uniqueness(
        &self,
        txn: &dyn Transaction,
        type_name: &str,
        descriptor: &IndexDescriptor,
        state: IndexState,
        key: &[Value],
        new_pk: &[Value],
        now: SystemTime,
    ) -> Result<()> {
        let prefix = self.key_prefix(&descriptor.name, key);
        let (begin, end) = Subspace::new(prefix.clone()).range();
        // Non-snapshot: the result gates whether this write proceeds, so it must add a read
        // conflict range on the index-key prefix, or two concurrent writers racing to claim the
        // same unique key could both observe no owner and both commit.
        for (entry_key, _) in txn.get_range(begin, end, false).await? {
            let suffix = &entry_key[prefix.len()..];
            let existing_pk = match codec::unpack(suffix)?.as_slice() {
                [Value::Tuple(pk)] => pk.clone(),
                _ => return Err(Error::malformed_tuple("malformed index entry suffix")),
            };
            if existing_pk == new_pk {
                continue;
            }
            match descriptor.uniqueness_check_mode {
                UniquenessCheckMode::Immediate if state == IndexState::Readable => {
                    return Err(Error::UniquenessViolation {
                        index_name: descriptor.name.clone(),
                        type_name: type_name.to_string(),
                        conflicting_values: key.to_vec(),
                        existing_pk,
                        new_pk: new_pk.to_vec(),
                    });
                }
                UniquenessCheckMode::Skip => {}
                _ => {
                    self.violations
                        .record_violation(
                            txn,
                            &descriptor.name,
                            type_name,
                            key,
                            existing_pk,
                            new_pk.to_vec(),
                            now,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::descriptor::{FieldExpr, IndexKind};
    use crate::kv::{Database, TestDatabase};

    fn maintainer() -> IndexMaintainer {
        IndexMaintainer::new(
            Subspace::new(b"I.".to_vec()),
            ViolationTracker::new(Subspace::new(b"meta.violations.".to_vec())),
        )
    }

    #[tokio::test]
    async fn readable_unique_index_rejects_conflicting_insert() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let mnt = maintainer();
        let email_index = IndexDescriptor::new(
            "User_email",
            IndexKind::Scalar,
            FieldExpr::Field("email".into()),
            true,
            UniquenessCheckMode::Immediate,
        )
        .unwrap();

        let u1_fields = vec![("email".to_string(), Value::Str("a@x".into()))];
        mnt.apply(
            txn.as_ref(),
            "User",
            &email_index,
            IndexState::Readable,
            None,
            &[],
            Some(&u1_fields),
            &[Value::Str("U1".into())],
            SystemTime::now(),
        )
        .await
        .unwrap();

        let err = mnt
            .apply(
                txn.as_ref(),
                "User",
                &email_index,
                IndexState::Readable,
                None,
                &[],
                Some(&u1_fields),
                &[Value::Str("U2".into())],
                SystemTime::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniquenessViolation { .. }));
    }

    #[tokio::test]
    async fn write_only_unique_index_records_violation_and_continues() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let mnt = maintainer();
        let email_index = IndexDescriptor::new(
            "User_email",
            IndexKind::Scalar,
            FieldExpr::Field("email".into()),
            true,
            UniquenessCheckMode::Immediate,
        )
        .unwrap();
        let u1_fields = vec![("email".to_string(), Value::Str("a@x".into()))];

        mnt.apply(
            txn.as_ref(),
            "User",
            &email_index,
            IndexState::WriteOnly,
            None,
            &[],
            Some(&u1_fields),
            &[Value::Str("U1".into())],
            SystemTime::now(),
        )
        .await
        .unwrap();
        mnt.apply(
            txn.as_ref(),
            "User",
            &email_index,
            IndexState::WriteOnly,
            None,
            &[],
            Some(&u1_fields),
            &[Value::Str("U2".into())],
            SystemTime::now(),
        )
        .await
        .unwrap();

        let violations = mnt
            .violations
            .scan_violations(txn.as_ref(), "User_email")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].primary_keys.len(), 2);
    }

    #[tokio::test]
    async fn array_fan_out_diff_removes_and_adds_single_elements() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let mnt = maintainer();
        let tags_index = IndexDescriptor::new(
            "Doc_tags",
            IndexKind::ArrayFanOut,
            FieldExpr::ArrayField("tags".into()),
            false,
            UniquenessCheckMode::Skip,
        )
        .unwrap();
        let pk = vec![Value::Str("D1".into())];
        let old_fields = vec![(
            "tags".to_string(),
            Value::Tuple(vec![Value::Str("a".into()), Value::Str("b".into()), Value::Str("c".into())]),
        )];
        let new_fields = vec![(
            "tags".to_string(),
            Value::Tuple(vec![Value::Str("b".into()), Value::Str("c".into()), Value::Str("d".into())]),
        )];

        mnt.apply(
            txn.as_ref(),
            "Doc",
            &tags_index,
            IndexState::Readable,
            None,
            &[],
            Some(&old_fields),
            &pk,
            SystemTime::now(),
        )
        .await
        .unwrap();

        let (begin, end) = mnt.index_subspace.range();
        let before: Vec<_> = txn.get_range(begin.clone(), end.clone(), true).await.unwrap().collect();
        assert_eq!(before.len(), 3);

        mnt.apply(
            txn.as_ref(),
            "Doc",
            &tags_index,
            IndexState::Readable,
            Some(&old_fields),
            &pk,
            Some(&new_fields),
            &pk,
            SystemTime::now(),
        )
        .await
        .unwrap();

        let after: Vec<_> = txn.get_range(begin, end, true).await.unwrap().collect();
        assert_eq!(after.len(), 3);
    }
}
