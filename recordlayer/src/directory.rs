//! Maps logical path tuples to byte-prefix subspaces, allocating a fresh prefix on first use and
//! preserving it across moves, with the mapping itself persisted and dynamically allocated rather
//! than statically assigned.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::codec::{self, Value};
use crate::error::{Error, Result};
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// One segment of a record type's directory path template: either a fixed literal, or a
/// placeholder filled in at resolution time from a partition binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Literal(String),
    Partition(String),
}

/// A record type's declared directory path, with zero or more partition placeholders.
pub type PathTemplate = Vec<PathSegment>;

/// Concrete field values supplied to fill a path template's partition placeholders.
pub type DirectoryBinding = HashMap<String, Value>;

/// Substitutes `binding` into `template`, producing a concrete path. Fails with
/// [`Error::MissingPartitionBinding`] if any placeholder's field is absent from `binding`.
pub fn resolve_template(
    template: &[PathSegment],
    binding: &DirectoryBinding,
    type_name: &str,
) -> Result<Vec<String>> {
    template
        .iter()
        .map(|segment| match segment {
            PathSegment::Literal(s) => Ok(s.clone()),
            PathSegment::Partition(field) => binding
                .get(field)
                .map(value_to_path_segment)
                .ok_or_else(|| Error::MissingPartitionBinding {
                    type_name: type_name.to_string(),
                    field: field.clone(),
                }),
        })
        .collect()
}

fn value_to_path_segment(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        Value::Uuid(u) => u.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    }
}

fn path_key(path: &[String]) -> Vec<Value> {
    path.iter().map(|s| Value::Str(s.clone())).collect()
}

/// Resolves directory path tuples to subspace prefixes, backed by a persisted mapping under a
/// `_directory` meta subspace and fronted by an in-process cache.
pub struct DirectoryLayer {
    meta: Subspace,
    data_root: Subspace,
    cache: RwLock<HashMap<Vec<String>, Subspace>>,
}

impl DirectoryLayer {
    pub fn new(meta: Subspace, data_root: Subspace) -> Self {
        Self {
            meta,
            data_root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn mapping_key(&self, path: &[String]) -> Vec<u8> {
        self.meta.pack(&path_key(path))
    }

    fn cached(&self, path: &[String]) -> Option<Subspace> {
        self.cache.read().expect("directory cache poisoned").get(path).cloned()
    }

    fn cache_insert(&self, path: Vec<String>, subspace: Subspace) {
        self.cache.write().expect("directory cache poisoned").insert(path, subspace);
    }

    fn cache_remove(&self, path: &[String]) {
        self.cache.write().expect("directory cache poisoned").remove(path);
    }

    async fn read_mapping(&self, txn: &dyn Transaction, path: &[String]) -> Result<Option<Subspace>> {
        match txn.get(&self.mapping_key(path), false).await? {
            Some(prefix) => Ok(Some(Subspace::new(prefix))),
            None => Ok(None),
        }
    }

    async fn allocate_prefix(&self, txn: &dyn Transaction) -> Result<Vec<u8>> {
        let counter_key = self.meta.pack(&[Value::Str("__nextPrefixId".to_string())]);
        let next = match txn.get(&counter_key, false).await? {
            Some(bytes) => match codec::unpack(&bytes)?.into_iter().next() {
                Some(Value::Int(n)) => n + 1,
                _ => return Err(Error::DirectoryPathError("corrupt prefix allocator state".to_string())),
            },
            None => 1,
        };
        txn.set(counter_key, codec::pack(&[Value::Int(next)])).await;
        Ok(self.data_root.pack(&[Value::Int(next)]))
    }

    /// Returns the subspace for `path`, allocating and persisting a fresh prefix if this is the
    /// first resolution.
    pub async fn get_or_open(&self, txn: &dyn Transaction, path: &[String]) -> Result<Subspace> {
        if let Some(subspace) = self.cached(path) {
            return Ok(subspace);
        }
        if let Some(subspace) = self.read_mapping(txn, path).await? {
            self.cache_insert(path.to_vec(), subspace.clone());
            return Ok(subspace);
        }
        let prefix = self.allocate_prefix(txn).await?;
        let subspace = Subspace::new(prefix.clone());
        txn.set(self.mapping_key(path), prefix).await;
        self.cache_insert(path.to_vec(), subspace.clone());
        Ok(subspace)
    }

    /// Creates `path`, failing with [`Error::DirectoryPathError`] if it already exists.
    pub async fn create_directory(&self, txn: &dyn Transaction, path: &[String]) -> Result<Subspace> {
        if self.directory_exists(txn, path).await? {
            return Err(Error::DirectoryPathError(format!(
                "directory {:?} already exists",
                path
            )));
        }
        self.get_or_open(txn, path).await
    }

    /// Opens `path`, failing with [`Error::DirectoryPathError`] if it does not exist.
    pub async fn open_directory(&self, txn: &dyn Transaction, path: &[String]) -> Result<Subspace> {
        if !self.directory_exists(txn, path).await? {
            return Err(Error::DirectoryPathError(format!("directory {:?} does not exist", path)));
        }
        self.get_or_open(txn, path).await
    }

    pub async fn directory_exists(&self, txn: &dyn Transaction, path: &[String]) -> Result<bool> {
        if self.cached(path).is_some() {
            return Ok(true);
        }
        Ok(self.read_mapping(txn, path).await?.is_some())
    }

    /// Re-binds `from`'s prefix under `to`, leaving the underlying data physically in place.
    pub async fn move_directory(&self, txn: &dyn Transaction, from: &[String], to: &[String]) -> Result<()> {
        let subspace = self
            .read_mapping(txn, from)
            .await?
            .ok_or_else(|| Error::DirectoryPathError(format!("directory {:?} does not exist", from)))?;
        if self.directory_exists(txn, to).await? {
            return Err(Error::DirectoryPathError(format!("directory {:?} already exists", to)));
        }
        txn.clear(self.mapping_key(from)).await;
        txn.set(self.mapping_key(to), subspace.prefix().to_vec()).await;
        self.cache_remove(from);
        self.cache_insert(to.to_vec(), subspace);
        Ok(())
    }

    /// Recursively removes `path` and every directory nested under it, clearing both the mapping
    /// entries and the physical data ranges they point at.
    pub async fn remove_directory(&self, txn: &dyn Transaction, path: &[String]) -> Result<()> {
        let prefix_key = self.meta.pack(&path_key(path));
        let (begin, end) = Subspace::new(prefix_key).range();
        let mut to_remove = Vec::new();
        for (key, value) in txn.get_range(begin.clone(), end.clone(), false).await? {
            to_remove.push((key, value));
        }
        for (_, prefix_bytes) in &to_remove {
            let (data_begin, data_end) = Subspace::new(prefix_bytes.clone()).range();
            txn.clear_range(data_begin, data_end).await;
        }
        txn.clear_range(begin, end).await;
        self.cache.write().expect("directory cache poisoned").retain(|cached_path, _| {
            !(cached_path.len() >= path.len() && cached_path[..path.len()] == *path)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Database, TestDatabase};

    fn layer() -> DirectoryLayer {
        DirectoryLayer::new(Subspace::new(b"dir.".to_vec()), Subspace::new(b"data.".to_vec()))
    }

    #[tokio::test]
    async fn resolving_the_same_path_twice_returns_the_same_prefix() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let layer = layer();
        let path = vec!["app".to_string(), "users".to_string()];
        let first = layer.get_or_open(txn.as_ref(), &path).await.unwrap();
        let second = layer.get_or_open(txn.as_ref(), &path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn create_directory_rejects_an_existing_path() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let layer = layer();
        let path = vec!["app".to_string()];
        layer.create_directory(txn.as_ref(), &path).await.unwrap();
        let err = layer.create_directory(txn.as_ref(), &path).await.unwrap_err();
        assert!(matches!(err, Error::DirectoryPathError(_)));
    }

    #[tokio::test]
    async fn open_directory_rejects_a_missing_path() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let layer = layer();
        let err = layer.open_directory(txn.as_ref(), &["missing".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::DirectoryPathError(_)));
    }

    #[tokio::test]
    async fn move_directory_preserves_the_prefix_under_a_new_path() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let layer = layer();
        let from = vec!["tenants".to_string(), "acme".to_string()];
        let to = vec!["tenants".to_string(), "acme-renamed".to_string()];
        let before = layer.get_or_open(txn.as_ref(), &from).await.unwrap();
        layer.move_directory(txn.as_ref(), &from, &to).await.unwrap();
        assert!(!layer.directory_exists(txn.as_ref(), &from).await.unwrap());
        let after = layer.get_or_open(txn.as_ref(), &to).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn remove_directory_clears_both_mapping_and_data() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let layer = layer();
        let path = vec!["tenants".to_string(), "acme".to_string()];
        let subspace = layer.get_or_open(txn.as_ref(), &path).await.unwrap();
        txn.set(subspace.pack(&[Value::Str("record-1".into())]), b"x".to_vec()).await;

        layer.remove_directory(txn.as_ref(), &path).await.unwrap();
        assert!(!layer.directory_exists(txn.as_ref(), &path).await.unwrap());
        assert!(txn
            .get(&subspace.pack(&[Value::Str("record-1".into())]), false)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn resolve_template_fills_partition_placeholders() {
        let template = vec![
            PathSegment::Literal("tenants".to_string()),
            PathSegment::Partition("tenantId".to_string()),
        ];
        let mut binding = DirectoryBinding::new();
        binding.insert("tenantId".to_string(), Value::Str("acme".into()));
        let resolved = resolve_template(&template, &binding, "TenantOrder").unwrap();
        assert_eq!(resolved, vec!["tenants".to_string(), "acme".to_string()]);
    }

    #[test]
    fn resolve_template_fails_on_missing_binding() {
        let template = vec![PathSegment::Partition("tenantId".to_string())];
        let err = resolve_template(&template, &DirectoryBinding::new(), "TenantOrder").unwrap_err();
        assert!(matches!(err, Error::MissingPartitionBinding { .. }));
    }
}
