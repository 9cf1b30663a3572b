//! Executes a [`PlanNode`] against a transaction, honoring a read-version cache policy and
//! returning a finite, restartable-per-execution result set.

use std::collections::HashSet;

use crate::codec::{self, Tuple, Value};
use crate::error::Result;
use crate::index::FieldDecoder;
use crate::kv::{Database, Transaction};
use crate::query::condition::Condition;
use crate::query::planner::PlanNode;
use crate::storage::ItemStorage;
use crate::subspace::Subspace;
use crate::txn::read_version_cache::{CachePolicy, ReadVersionCache};

/// One decoded row: its primary key and its decoded fields.
pub type Row = (Tuple, Vec<(String, Value)>);

/// Everything the executor needs to turn a [`PlanNode`] into rows, independent of any particular
/// record type's Rust representation.
#[derive(Clone)]
pub struct ExecutionOptions {
    pub record_subspace: Subspace,
    pub blobs_subspace: Subspace,
    pub index_subspace: Subspace,
    pub item_storage: ItemStorage,
    pub decode_fields: FieldDecoder,
}

/// A finite, already-materialized result set. Restartable: `iter()`/`first()`/`count()` can each
/// be called any number of times against the same instance without re-querying the store.
#[derive(Debug, Clone, Default)]
pub struct QueryResults {
    rows: Vec<Row>,
}

impl QueryResults {
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Executes `plan` against `txn`, applying `offset` then `limit` to the final row sequence.
pub async fn execute(
    txn: &dyn Transaction,
    plan: &PlanNode,
    options: &ExecutionOptions,
    limit: Option<usize>,
    offset: usize,
) -> Result<QueryResults> {
    let mut rows = execute_node(txn, plan, options).await?;
    if offset > 0 {
        rows = rows.into_iter().skip(offset).collect();
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(QueryResults { rows })
}

/// Sets `txn`'s read version per `cache_policy`: `Server` always obtains a fresh version from
/// the store; any other policy first tries `cache`, falling back to a fresh version (and
/// updating `cache`) on a miss. Shared by every read path that accepts a [`CachePolicy`] —
/// fetch queries and the by-id point-read API alike.
pub async fn source_read_version(txn: &dyn Transaction, cache: Option<&ReadVersionCache>, cache_policy: CachePolicy) -> Result<()> {
    let cached_version = match cache_policy {
        CachePolicy::Server => None,
        policy => cache.and_then(|c| c.get_cached_version(policy)),
    };
    match cached_version {
        Some(version) => txn.set_read_version(version).await,
        None => {
            let version = txn.get_read_version().await?;
            if let Some(c) = cache {
                c.update_read_version(version);
            }
        }
    }
    Ok(())
}

/// Obtains a transaction from `db`, sources its read version per `cache_policy` (consulting
/// `cache` when given), and executes `plan`.
pub async fn execute_with_cache_policy(
    db: &dyn Database,
    cache: Option<&ReadVersionCache>,
    cache_policy: CachePolicy,
    plan: &PlanNode,
    options: &ExecutionOptions,
    limit: Option<usize>,
    offset: usize,
) -> Result<QueryResults> {
    let txn = db.create_transaction().await;
    source_read_version(txn.as_ref(), cache, cache_policy).await?;
    execute(txn.as_ref(), plan, options, limit, offset).await
}

fn execute_node<'a>(
    txn: &'a dyn Transaction,
    node: &'a PlanNode,
    options: &'a ExecutionOptions,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Row>>> + Send + 'a>> {
    Box::pin(async move {
        match node {
            PlanNode::Filter { input, condition } => {
                let rows = execute_node(txn, input, options).await?;
                Ok(filter_rows(rows, condition))
            }
            PlanNode::Sort { input, fields } => {
                let mut rows = execute_node(txn, input, options).await?;
                rows.sort_by(|a, b| sort_key(a, fields).cmp(&sort_key(b, fields)));
                Ok(rows)
            }
            _ => {
                let keys = resolve_keys(txn, node, options).await?;
                let mut rows = Vec::with_capacity(keys.len());
                for pk in keys {
                    if let Some(fields) = load_row(txn, &pk, options).await? {
                        rows.push((pk, fields));
                    }
                }
                Ok(rows)
            }
        }
    })
}

fn filter_rows(rows: Vec<Row>, condition: &Condition) -> Vec<Row> {
    rows.into_iter().filter(|(_, fields)| condition.evaluate(fields)).collect()
}

fn sort_key(row: &Row, fields: &[String]) -> Vec<Value> {
    fields
        .iter()
        .map(|name| {
            row.1
                .iter()
                .find(|(field_name, _)| field_name == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null)
        })
        .collect()
}

async fn load_row(txn: &dyn Transaction, pk: &[Value], options: &ExecutionOptions) -> Result<Option<Vec<(String, Value)>>> {
    let base_key = options.record_subspace.pack(pk);
    let bytes = options
        .item_storage
        .read(txn, &base_key, &options.blobs_subspace, pk, true)
        .await?;
    match bytes {
        Some(bytes) => Ok(Some((options.decode_fields)(&bytes)?)),
        None => Ok(None),
    }
}

fn resolve_keys<'a>(
    txn: &'a dyn Transaction,
    node: &'a PlanNode,
    options: &'a ExecutionOptions,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Tuple>>> + Send + 'a>> {
    Box::pin(async move {
        match node {
            PlanNode::TableScan => {
                let (begin, end) = options.record_subspace.range();
                let prefix_len = options.record_subspace.prefix().len();
                let mut keys = Vec::new();
                for (key, _) in txn.get_range(begin, end, true).await? {
                    keys.push(codec::unpack(&key[prefix_len..])?);
                }
                Ok(keys)
            }
            PlanNode::IndexScan { index_name } => {
                let prefix = options.index_subspace.pack(&[Value::Str(index_name.clone())]);
                let (begin, end) = Subspace::new(prefix.clone()).range();
                let mut keys = Vec::new();
                for (key, _) in txn.get_range(begin, end, true).await? {
                    let values = codec::unpack(&key[prefix.len()..])?;
                    if let [_index_key, Value::Tuple(pk)] = values.as_slice() {
                        keys.push(pk.clone());
                    }
                }
                Ok(keys)
            }
            PlanNode::Intersection(children) => {
                let mut sets = Vec::with_capacity(children.len());
                for child in children {
                    let keys = resolve_keys(txn, child, options).await?;
                    sets.push(keys.into_iter().collect::<HashSet<_>>());
                }
                let mut iter = sets.into_iter();
                let first = iter.next().unwrap_or_default();
                let intersected = iter.fold(first, |acc, set| acc.intersection(&set).cloned().collect());
                Ok(intersected.into_iter().collect())
            }
            PlanNode::Union(children) => {
                let mut union: HashSet<Tuple> = HashSet::new();
                for child in children {
                    union.extend(resolve_keys(txn, child, options).await?);
                }
                Ok(union.into_iter().collect())
            }
            PlanNode::Filter { .. } | PlanNode::Sort { .. } => {
                let rows = execute_node(txn, node, options).await?;
                Ok(rows.into_iter().map(|(pk, _)| pk).collect())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::TestDatabase;
    use crate::split::SplitConfig;
    use crate::storage::StorageConfig;
    use std::sync::Arc as StdArc;

    fn options() -> ExecutionOptions {
        let decode: FieldDecoder = StdArc::new(|bytes: &[u8]| {
            let tuple = codec::unpack(bytes)?;
            Ok(vec![("name".to_string(), tuple.into_iter().next().unwrap_or(Value::Null))])
        });
        ExecutionOptions {
            record_subspace: Subspace::new(b"R.".to_vec()),
            blobs_subspace: Subspace::new(b"B.".to_vec()),
            index_subspace: Subspace::new(b"I.".to_vec()),
            item_storage: ItemStorage::new(StorageConfig {
                compression_threshold: 256,
                split: SplitConfig::default(),
            }),
            decode_fields: decode,
        }
    }

    async fn seed(txn: &dyn Transaction, options: &ExecutionOptions, id: &str, name: &str) {
        let pk = vec![Value::Str(id.to_string())];
        let base_key = options.record_subspace.pack(&pk);
        let value = codec::pack(&[Value::Str(name.to_string())]);
        options
            .item_storage
            .write(txn, base_key, &options.blobs_subspace, &pk, &value)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn table_scan_returns_every_row() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let options = options();
        seed(txn.as_ref(), &options, "a", "Alice").await;
        seed(txn.as_ref(), &options, "b", "Bob").await;

        let results = execute(txn.as_ref(), &PlanNode::TableScan, &options, None, 0).await.unwrap();
        assert_eq!(results.count(), 2);
    }

    #[tokio::test]
    async fn filter_narrows_the_table_scan() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let options = options();
        seed(txn.as_ref(), &options, "a", "Alice").await;
        seed(txn.as_ref(), &options, "b", "Bob").await;

        let plan = PlanNode::Filter {
            input: Box::new(PlanNode::TableScan),
            condition: Condition::eq("name", "Bob"),
        };
        let results = execute(txn.as_ref(), &plan, &options, None, 0).await.unwrap();
        assert_eq!(results.count(), 1);
        assert_eq!(results.first().unwrap().0, vec![Value::Str("b".into())]);
    }

    #[tokio::test]
    async fn limit_and_offset_slice_the_sorted_result() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let options = options();
        seed(txn.as_ref(), &options, "a", "Alice").await;
        seed(txn.as_ref(), &options, "b", "Bob").await;
        seed(txn.as_ref(), &options, "c", "Carol").await;

        let plan = PlanNode::Sort {
            input: Box::new(PlanNode::TableScan),
            fields: vec!["name".to_string()],
        };
        let results = execute(txn.as_ref(), &plan, &options, Some(1), 1).await.unwrap();
        assert_eq!(results.count(), 1);
        assert_eq!(results.first().unwrap().1[0].1, Value::Str("Bob".into()));
    }

    #[tokio::test]
    async fn cache_policy_server_always_obtains_a_fresh_version() {
        let db = TestDatabase::new();
        let options = options();
        let cache = ReadVersionCache::new();
        cache.update_read_version(999);
        let results = execute_with_cache_policy(&db, Some(&cache), CachePolicy::Server, &PlanNode::TableScan, &options, None, 0)
            .await
            .unwrap();
        assert_eq!(results.count(), 0);
    }
}
