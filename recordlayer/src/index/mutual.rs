//! The mutual (bidirectional) indexer.
//!
//! A mutual index is two ordinary scalar/composite indexes declared over the same pair of
//! fields with swapped (or, for a symmetric relationship, canonicalized) key order, built in one
//! scan via [`crate::index::online::OnlineIndexer`]'s multi-target support. This module supplies
//! the descriptor pair and the post-build sample-verification step; it adds no new build
//! machinery of its own, avoiding the cyclic object graph a literal "paired index" type would
//! invite.

use crate::codec::Value;
use crate::error::Result;
use crate::index::descriptor::{FieldExpr, IndexDescriptor, IndexKind, UniquenessCheckMode};
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// Declares one mutual index relationship.
#[derive(Debug, Clone)]
pub struct MutualIndexConfig {
    pub forward_name: String,
    pub reverse_name: String,
    pub source_field: String,
    pub target_field: String,
    /// When `true`, both sides store the canonicalized `(min, max)` key, so `(A, B)` and `(B, A)`
    /// collapse to one logical pair.
    pub is_symmetric: bool,
    /// Upper bound on how many forward entries [`verify_sample`] inspects.
    pub sample_limit: usize,
}

/// Builds the forward/reverse descriptor pair for `config`. Both are non-unique: a mutual
/// index's purpose is traversal, not uniqueness enforcement.
pub fn mutual_descriptors(config: &MutualIndexConfig) -> (IndexDescriptor, IndexDescriptor) {
    let (forward_expr, reverse_expr) = if config.is_symmetric {
        let canonical = FieldExpr::CanonicalPair(config.source_field.clone(), config.target_field.clone());
        (canonical.clone(), canonical)
    } else {
        (
            FieldExpr::Composite(vec![config.source_field.clone(), config.target_field.clone()]),
            FieldExpr::Composite(vec![config.target_field.clone(), config.source_field.clone()]),
        )
    };
    let forward = IndexDescriptor::new(
        config.forward_name.clone(),
        IndexKind::Mutual,
        forward_expr,
        false,
        UniquenessCheckMode::Skip,
    )
    .expect("mutual index descriptors are always non-unique");
    let reverse = IndexDescriptor::new(
        config.reverse_name.clone(),
        IndexKind::Mutual,
        reverse_expr,
        false,
        UniquenessCheckMode::Skip,
    )
    .expect("mutual index descriptors are always non-unique");
    (forward, reverse)
}

/// Scans up to `config.sample_limit` forward entries and checks each has a corresponding reverse
/// entry. Inconsistencies are logged as warnings and returned for the caller's own reporting;
/// they never fail the build.
pub async fn verify_sample(
    txn: &dyn Transaction,
    index_subspace: &Subspace,
    config: &MutualIndexConfig,
) -> Result<Vec<String>> {
    let forward_prefix = index_subspace.pack(&[Value::Str(config.forward_name.clone())]);
    let reverse_prefix = index_subspace.pack(&[Value::Str(config.reverse_name.clone())]);
    let (begin, end) = Subspace::new(forward_prefix.clone()).range();

    let mut warnings = Vec::new();
    let mut inspected = 0usize;
    for (key, _) in txn.get_range(begin, end, true).await? {
        if inspected >= config.sample_limit {
            break;
        }
        inspected += 1;

        let suffix = &key[forward_prefix.len()..];
        let values = crate::codec::unpack(suffix)?;
        let (index_key, pk) = match values.as_slice() {
            [Value::Tuple(k), Value::Tuple(pk)] => (k.clone(), pk.clone()),
            _ => {
                warnings.push(format!("malformed forward entry at {:?}", key));
                continue;
            }
        };

        let reverse_key = if config.is_symmetric {
            index_key.clone()
        } else {
            let mut reversed = index_key.clone();
            reversed.reverse();
            reversed
        };

        let reverse_entry = index_subspace.pack(&[
            Value::Str(config.reverse_name.clone()),
            Value::Tuple(reverse_key),
            Value::Tuple(pk.clone()),
        ]);
        if txn.get(&reverse_entry, true).await?.is_none() {
            let message = format!(
                "mutual index `{}`/`{}`: forward entry {:?} has no corresponding reverse entry",
                config.forward_name, config.reverse_name, index_key
            );
            tracing::warn!(
                forward_index = %config.forward_name,
                reverse_index = %config.reverse_name,
                ?index_key,
                "mutual index sample verification found an inconsistency"
            );
            warnings.push(message);
        }
    }
    let _ = reverse_prefix;
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::descriptor::UniquenessCheckMode;
    use crate::index::maintainer::IndexMaintainer;
    use crate::index::state::IndexState;
    use crate::kv::{Database, TestDatabase};
    use crate::violations::ViolationTracker;
    use std::time::SystemTime;

    fn config(symmetric: bool) -> MutualIndexConfig {
        MutualIndexConfig {
            forward_name: "follows".into(),
            reverse_name: "followedBy".into(),
            source_field: "follower".into(),
            target_field: "followee".into(),
            is_symmetric: symmetric,
            sample_limit: 10,
        }
    }

    #[tokio::test]
    async fn consistent_build_has_no_warnings() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let index_subspace = Subspace::new(b"I.".to_vec());
        let maintainer = IndexMaintainer::new(
            index_subspace.clone(),
            ViolationTracker::new(Subspace::new(b"meta.violations.".to_vec())),
        );
        let cfg = config(false);
        let (forward, reverse) = mutual_descriptors(&cfg);
        let fields = vec![
            ("follower".to_string(), Value::Str("alice".into())),
            ("followee".to_string(), Value::Str("bob".into())),
        ];
        let pk = vec![Value::Str("edge-1".into())];
        for descriptor in [&forward, &reverse] {
            maintainer
                .apply(
                    txn.as_ref(),
                    "Follow",
                    descriptor,
                    IndexState::Readable,
                    None,
                    &[],
                    Some(&fields),
                    &pk,
                    SystemTime::now(),
                )
                .await
                .unwrap();
        }

        let warnings = verify_sample(txn.as_ref(), &index_subspace, &cfg).await.unwrap();
        assert!(warnings.is_empty());
        assert!(matches!(UniquenessCheckMode::Skip, UniquenessCheckMode::Skip));
    }

    #[tokio::test]
    async fn missing_reverse_entry_is_reported_as_a_warning() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let index_subspace = Subspace::new(b"I.".to_vec());
        let maintainer = IndexMaintainer::new(
            index_subspace.clone(),
            ViolationTracker::new(Subspace::new(b"meta.violations.".to_vec())),
        );
        let cfg = config(true);
        let (forward, _reverse) = mutual_descriptors(&cfg);
        let fields = vec![
            ("follower".to_string(), Value::Str("alice".into())),
            ("followee".to_string(), Value::Str("bob".into())),
        ];
        let pk = vec![Value::Str("edge-1".into())];
        maintainer
            .apply(
                txn.as_ref(),
                "Follow",
                &forward,
                IndexState::Readable,
                None,
                &[],
                Some(&fields),
                &pk,
                SystemTime::now(),
            )
            .await
            .unwrap();

        let warnings = verify_sample(txn.as_ref(), &index_subspace, &cfg).await.unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
