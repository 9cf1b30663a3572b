//! The user-facing transaction context: CRUD, fetch-query, enumerate, index lifecycle
//! management, and `withTransaction`, wired atop the directory layer, index maintenance, the
//! security delegate, and the query planner/executor.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;

use crate::codec::{Tuple, Value};
use crate::directory::{DirectoryBinding, DirectoryLayer, PathSegment, PathTemplate};
use crate::error::{Error, Result};
use crate::index::{FieldDecoder, IndexMaintainer, IndexState, IndexStateManager, OnlineIndexConfig, OnlineIndexReport, OnlineIndexer};
use crate::kv::{Database, Transaction};
use crate::query::condition::Condition;
use crate::query::executor::{execute_with_cache_policy, source_read_version, ExecutionOptions, QueryResults, Row};
use crate::query::planner::{self, indexed_field_names, PlannerConfig};
use crate::record::{RecordEncoder, RecordType};
use crate::security::{Operation, SecurityContext, SecurityDelegate};
use crate::storage::{ItemStorage, StorageConfig};
use crate::subspace::Subspace;
use crate::txn::read_version_cache::{CachePolicy, ReadVersionCache};
use crate::txn::runner::{run, RunnerConfig};
use crate::txn::throttle::ThrottleConfig;
use crate::violations::{ViolationSummary, ViolationTracker};

/// The root of one record-oriented store. Holds the directory layer, the shared index state
/// table, the security delegate, and the defaults that operations fall back to when not
/// overridden per call.
pub struct Store {
    db: Arc<dyn Database>,
    root: Subspace,
    directory: Arc<DirectoryLayer>,
    index_state: Arc<IndexStateManager>,
    security: Arc<SecurityDelegate>,
    read_version_cache: ReadVersionCache,
    item_storage: ItemStorage,
    planner_config: PlannerConfig,
}

impl Store {
    pub fn new(db: Arc<dyn Database>, root: Subspace, security: SecurityDelegate) -> Self {
        let directory = Arc::new(DirectoryLayer::new(root.child(b"_directory"), root.child(b"_data")));
        let index_state = Arc::new(IndexStateManager::new(root.child(b"_meta.indexState")));
        Self {
            db,
            root,
            directory,
            index_state,
            security: Arc::new(security),
            read_version_cache: ReadVersionCache::new(),
            item_storage: ItemStorage::new(StorageConfig::default()),
            planner_config: PlannerConfig::default(),
        }
    }

    pub fn with_storage_config(mut self, config: StorageConfig) -> Self {
        self.item_storage = ItemStorage::new(config);
        self
    }

    pub fn with_planner_config(mut self, config: PlannerConfig) -> Self {
        self.planner_config = config;
        self
    }

    fn violations(&self) -> ViolationTracker {
        ViolationTracker::new(self.root.child(b"_meta.violations"))
    }

    fn path_template<T: RecordType>() -> PathTemplate {
        let mut template: PathTemplate = T::directory_path().into_iter().map(PathSegment::Literal).collect();
        template.extend(T::partition_field_names().iter().map(|f| PathSegment::Partition((*f).to_string())));
        template
    }

    fn resolve_path<T: RecordType>(partition: Option<&DirectoryBinding>) -> Result<Vec<String>> {
        let empty = DirectoryBinding::new();
        crate::directory::resolve_template(&Self::path_template::<T>(), partition.unwrap_or(&empty), T::type_name())
    }

    fn binding_from_record<T: RecordType>(record: &T) -> DirectoryBinding {
        T::partition_field_names()
            .iter()
            .map(|n| n.to_string())
            .zip(record.partition_values())
            .collect()
    }

    fn partition_fields<T: RecordType>(binding: Option<&DirectoryBinding>) -> Vec<(String, Value)> {
        let binding = match binding {
            Some(b) => b,
            None => return Vec::new(),
        };
        T::partition_field_names()
            .iter()
            .filter_map(|name| binding.get(*name).map(|v| ((*name).to_string(), v.clone())))
            .collect()
    }

    fn decode_fields<T: RecordType>() -> FieldDecoder {
        Arc::new(|bytes: &[u8]| RecordEncoder::decode_full(T::field_names(), bytes))
    }

    fn execution_options<T: RecordType>(&self, ds: &Subspace) -> ExecutionOptions {
        ExecutionOptions {
            record_subspace: ds.child(b"R"),
            blobs_subspace: ds.child(b"B"),
            index_subspace: ds.child(b"I"),
            item_storage: self.item_storage.clone(),
            decode_fields: Self::decode_fields::<T>(),
        }
    }

    fn decode_record<T: RecordType>(&self, bytes: &[u8], binding: Option<&DirectoryBinding>) -> Result<T> {
        let fields = RecordEncoder::decode_full(T::field_names(), bytes)?;
        T::from_fields(Self::partition_fields::<T>(binding), fields)
    }

    /// Inserts or replaces `record`, diffing and updating every non-disabled index declared on
    /// `T`.
    pub async fn set<T: RecordType>(&self, record: &T, caller: &SecurityContext) -> Result<()> {
        let pk = record.primary_key();
        let binding = Self::binding_from_record(record);
        let path = Self::resolve_path::<T>(Some(&binding))?;
        let txn = self.db.create_transaction().await;
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let record_subspace = ds.child(b"R");
        let blobs_subspace = ds.child(b"B");
        let base_key = record_subspace.pack(&pk);

        let old_bytes = self.item_storage.read(txn.as_ref(), &base_key, &blobs_subspace, &pk, false).await?;
        let old_fields = old_bytes
            .as_deref()
            .map(|b| RecordEncoder::decode_full(T::field_names(), b))
            .transpose()?;
        let operation = if old_fields.is_some() { Operation::Update } else { Operation::Create };
        self.security.check(operation, T::type_name(), caller)?;

        let new_fields = record.fields();
        let value = RecordEncoder::encode_full(record);
        self.item_storage.write(txn.as_ref(), base_key, &blobs_subspace, &pk, &value).await?;

        let maintainer = IndexMaintainer::new(ds.child(b"I"), self.violations());
        let now = SystemTime::now();
        for descriptor in T::indexes() {
            let state = self.index_state.state(txn.as_ref(), &descriptor.name).await?;
            if state == IndexState::Disabled {
                continue;
            }
            maintainer
                .apply(
                    txn.as_ref(),
                    T::type_name(),
                    &descriptor,
                    state,
                    old_fields.as_deref(),
                    &pk,
                    Some(&new_fields),
                    &pk,
                    now,
                )
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Fetches one record by primary key. Returns `Ok(None)` if absent. `cache_policy` sources
    /// the transaction's read version the same way a fetch query does; `snapshot` controls
    /// whether the point read adds to the transaction's conflict range.
    pub async fn get<T: RecordType>(
        &self,
        id: Tuple,
        partition: Option<DirectoryBinding>,
        cache_policy: CachePolicy,
        snapshot: bool,
        caller: &SecurityContext,
    ) -> Result<Option<T>> {
        self.security.check(Operation::Get, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let txn = self.db.create_transaction().await;
        source_read_version(txn.as_ref(), Some(&self.read_version_cache), cache_policy).await?;
        if !self.directory.directory_exists(txn.as_ref(), &path).await? {
            return Ok(None);
        }
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let base_key = ds.child(b"R").pack(&id);
        match self.item_storage.read(txn.as_ref(), &base_key, &ds.child(b"B"), &id, snapshot).await? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes, partition.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Fetches several records by primary key, preserving `ids`' order; missing entries decode
    /// to `None` at their position. The whole batch is read from a single transaction sharing
    /// one sourced read version, so `cache_policy` is honored once per call rather than once per
    /// id.
    pub async fn get_many<T: RecordType>(
        &self,
        ids: Vec<Tuple>,
        partition: Option<DirectoryBinding>,
        cache_policy: CachePolicy,
        snapshot: bool,
        caller: &SecurityContext,
    ) -> Result<Vec<Option<T>>> {
        self.security.check(Operation::Get, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let txn = self.db.create_transaction().await;
        source_read_version(txn.as_ref(), Some(&self.read_version_cache), cache_policy).await?;
        if !self.directory.directory_exists(txn.as_ref(), &path).await? {
            return Ok(ids.iter().map(|_| None).collect());
        }
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let base_key = ds.child(b"R").pack(&id);
            let record = match self.item_storage.read(txn.as_ref(), &base_key, &ds.child(b"B"), &id, snapshot).await? {
                Some(bytes) => Some(self.decode_record(&bytes, partition.as_ref())?),
                None => None,
            };
            out.push(record);
        }
        Ok(out)
    }

    /// Deletes one record, removing its index entries. Returns `false` if it did not exist.
    pub async fn delete<T: RecordType>(
        &self,
        id: Tuple,
        partition: Option<DirectoryBinding>,
        caller: &SecurityContext,
    ) -> Result<bool> {
        self.security.check(Operation::Delete, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let txn = self.db.create_transaction().await;
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let base_key = ds.child(b"R").pack(&id);
        let blobs_subspace = ds.child(b"B");
        let bytes = self.item_storage.read(txn.as_ref(), &base_key, &blobs_subspace, &id, false).await?;
        let old_fields = match &bytes {
            Some(b) => RecordEncoder::decode_full(T::field_names(), b)?,
            None => return Ok(false),
        };
        self.item_storage.delete(txn.as_ref(), &base_key, &blobs_subspace, &id).await?;
        let maintainer = IndexMaintainer::new(ds.child(b"I"), self.violations());
        let now = SystemTime::now();
        for descriptor in T::indexes() {
            let state = self.index_state.state(txn.as_ref(), &descriptor.name).await?;
            if state == IndexState::Disabled {
                continue;
            }
            maintainer
                .apply(txn.as_ref(), T::type_name(), &descriptor, state, Some(&old_fields), &id, None, &id, now)
                .await?;
        }
        txn.commit().await?;
        Ok(true)
    }

    /// Deletes every record of `T` within `partition`. Fails with
    /// [`Error::MissingPartitionBinding`] for a partitioned type with no binding supplied.
    pub async fn delete_all<T: RecordType>(&self, partition: Option<DirectoryBinding>, caller: &SecurityContext) -> Result<u64> {
        self.security.check(Operation::Delete, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let txn = self.db.create_transaction().await;
        if !self.directory.directory_exists(txn.as_ref(), &path).await? {
            return Ok(0);
        }
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let record_subspace = ds.child(b"R");
        let (begin, end) = record_subspace.range();
        let prefix_len = record_subspace.prefix().len();
        let mut keys = Vec::new();
        for (key, _) in txn.get_range(begin, end, false).await? {
            keys.push(crate::codec::unpack(&key[prefix_len..])?);
        }
        let mut removed = 0u64;
        for pk in keys {
            if self.delete::<T>(pk, partition.clone(), caller).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Invokes `callback` with every record of `T` within `partition`, in primary-key order.
    pub async fn enumerate<T: RecordType>(
        &self,
        partition: Option<DirectoryBinding>,
        caller: &SecurityContext,
        mut callback: impl FnMut(T),
    ) -> Result<()> {
        self.security.check(Operation::List, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let txn = self.db.create_transaction().await;
        if !self.directory.directory_exists(txn.as_ref(), &path).await? {
            return Ok(());
        }
        let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
        let record_subspace = ds.child(b"R");
        let blobs_subspace = ds.child(b"B");
        let (begin, end) = record_subspace.range();
        let prefix_len = record_subspace.prefix().len();
        let mut keys = Vec::new();
        for (key, _) in txn.get_range(begin, end, true).await? {
            keys.push(crate::codec::unpack(&key[prefix_len..])?);
        }
        for pk in keys {
            let base_key = record_subspace.pack(&pk);
            if let Some(bytes) = self.item_storage.read(txn.as_ref(), &base_key, &blobs_subspace, &pk, true).await? {
                let record: T = self.decode_record(&bytes, partition.as_ref())?;
                callback(record);
            }
        }
        Ok(())
    }

    /// Starts a fetch-query builder over `T`.
    pub fn fetch<T: RecordType>(&self) -> FetchBuilder<'_, T> {
        FetchBuilder {
            store: self,
            condition: Condition::AlwaysTrue,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            cache_policy: CachePolicy::Server,
            partition: None,
            _marker: PhantomData,
        }
    }

    /// Runs `body` against a transaction obtained, retried, and committed per `config` (the
    /// runner's defaults if `None`).
    pub async fn with_transaction<F, Fut, R>(&self, config: Option<RunnerConfig>, body: F) -> Result<R>
    where
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let config = config.unwrap_or_default();
        run(self.db.as_ref(), &config, &[], Some(&self.read_version_cache), None, body).await
    }

    /// `disabled -> writeOnly`: starts maintaining `index_name` on every write without yet
    /// serving reads from it.
    pub async fn enable_index<T: RecordType>(&self, index_name: &str, caller: &SecurityContext) -> Result<()> {
        self.security.check(Operation::Admin, T::type_name(), caller)?;
        let txn = self.db.create_transaction().await;
        self.index_state.enable(txn.as_ref(), index_name).await?;
        txn.commit().await?;
        Ok(())
    }

    /// `writeOnly -> readable`.
    pub async fn make_index_readable<T: RecordType>(&self, index_name: &str, caller: &SecurityContext) -> Result<()> {
        self.security.check(Operation::Admin, T::type_name(), caller)?;
        let txn = self.db.create_transaction().await;
        self.index_state.make_readable(txn.as_ref(), index_name).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Any state `-> disabled`.
    pub async fn disable_index<T: RecordType>(&self, index_name: &str, caller: &SecurityContext) -> Result<()> {
        self.security.check(Operation::Admin, T::type_name(), caller)?;
        let txn = self.db.create_transaction().await;
        self.index_state.disable(txn.as_ref(), index_name).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Runs a background build for `index_names` (a subset of `T::indexes()`) to completion, then
    /// promotes each to `readable`.
    pub async fn build_index<T: RecordType>(
        &self,
        index_names: &[&str],
        partition: Option<DirectoryBinding>,
        job_name: &str,
        clear_first: bool,
        throttle: ThrottleConfig,
        caller: &SecurityContext,
    ) -> Result<OnlineIndexReport> {
        self.security.check(Operation::Admin, T::type_name(), caller)?;
        let path = Self::resolve_path::<T>(partition.as_ref())?;
        let ds = {
            let txn = self.db.create_transaction().await;
            let ds = self.directory.get_or_open(txn.as_ref(), &path).await?;
            txn.commit().await?;
            ds
        };
        let targets: Vec<_> = T::indexes().into_iter().filter(|d| index_names.contains(&d.name.as_str())).collect();
        if targets.len() != index_names.len() {
            return Err(Error::DirectoryPathError(format!(
                "one or more of {:?} is not declared on {}",
                index_names,
                T::type_name()
            )));
        }
        let indexer = OnlineIndexer::new(
            Arc::clone(&self.db),
            T::type_name(),
            ds.child(b"R"),
            ds.child(b"B"),
            ds.child(b"I"),
            self.root.child(b"_meta.violations"),
            self.root.child(b"_meta.rangeset"),
            targets,
            Arc::clone(&self.index_state),
            self.item_storage.clone(),
            Self::decode_fields::<T>(),
            OnlineIndexConfig {
                job_name: job_name.to_string(),
                clear_first,
                throttle,
            },
        );
        indexer.build().await
    }

    /// Summarizes outstanding uniqueness violations tracked against `index_name`.
    pub async fn violation_summary<T: RecordType>(&self, index_name: &str, caller: &SecurityContext) -> Result<ViolationSummary> {
        self.security.check(Operation::Admin, T::type_name(), caller)?;
        let txn = self.db.create_transaction().await;
        self.violations().violation_summary(txn.as_ref(), index_name).await
    }

    pub async fn directory_create(&self, path: &[String], caller: &SecurityContext) -> Result<Subspace> {
        self.security.check(Operation::Admin, "_directory", caller)?;
        let txn = self.db.create_transaction().await;
        let subspace = self.directory.create_directory(txn.as_ref(), path).await?;
        txn.commit().await?;
        Ok(subspace)
    }

    pub async fn directory_open(&self, path: &[String], caller: &SecurityContext) -> Result<Subspace> {
        self.security.check(Operation::Admin, "_directory", caller)?;
        let txn = self.db.create_transaction().await;
        self.directory.open_directory(txn.as_ref(), path).await
    }

    pub async fn directory_exists(&self, path: &[String], caller: &SecurityContext) -> Result<bool> {
        self.security.check(Operation::Admin, "_directory", caller)?;
        let txn = self.db.create_transaction().await;
        self.directory.directory_exists(txn.as_ref(), path).await
    }

    pub async fn directory_move(&self, from: &[String], to: &[String], caller: &SecurityContext) -> Result<()> {
        self.security.check(Operation::Admin, "_directory", caller)?;
        let txn = self.db.create_transaction().await;
        self.directory.move_directory(txn.as_ref(), from, to).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn directory_remove(&self, path: &[String], caller: &SecurityContext) -> Result<()> {
        self.security.check(Operation::Admin, "_directory", caller)?;
        let txn = self.db.create_transaction().await;
        self.directory.remove_directory(txn.as_ref(), path).await?;
        txn.commit().await?;
        Ok(())
    }
}

/// A fluent fetch-query builder, mirroring the chainable `.where/.orderBy/.limit/.offset` style
/// user-facing surface.
pub struct FetchBuilder<'s, T: RecordType> {
    store: &'s Store,
    condition: Condition,
    order_by: Vec<String>,
    limit: Option<usize>,
    offset: usize,
    cache_policy: CachePolicy,
    partition: Option<DirectoryBinding>,
    _marker: PhantomData<T>,
}

impl<'s, T: RecordType> FetchBuilder<'s, T> {
    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn order_by(mut self, fields: Vec<String>) -> Self {
        self.order_by = fields;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn partition(mut self, binding: DirectoryBinding) -> Self {
        self.partition = Some(binding);
        self
    }

    async fn run(&self, caller: &SecurityContext, limit_override: Option<usize>) -> Result<QueryResults> {
        self.store.security.check(Operation::List, T::type_name(), caller)?;
        let path = Store::resolve_path::<T>(self.partition.as_ref())?;
        let txn = self.store.db.create_transaction().await;
        if !self.store.directory.directory_exists(txn.as_ref(), &path).await? {
            return Ok(QueryResults::default());
        }
        let ds = self.store.directory.get_or_open(txn.as_ref(), &path).await?;
        let options = self.store.execution_options::<T>(&ds);
        let indexed = indexed_field_names(&T::indexes());
        let order = if self.order_by.is_empty() { None } else { Some(self.order_by.as_slice()) };
        let plan = planner::plan(&self.condition, &indexed, order, &self.store.planner_config)?;
        execute_with_cache_policy(
            self.store.db.as_ref(),
            Some(&self.store.read_version_cache),
            self.cache_policy,
            &plan.root,
            &options,
            limit_override.or(self.limit),
            self.offset,
        )
        .await
    }

    pub async fn execute(&self, caller: &SecurityContext) -> Result<QueryResults> {
        self.run(caller, None).await
    }

    pub async fn first(&self, caller: &SecurityContext) -> Result<Option<Row>> {
        Ok(self.run(caller, Some(1)).await?.into_rows().into_iter().next())
    }

    pub async fn count(&self, caller: &SecurityContext) -> Result<usize> {
        Ok(self.run(caller, None).await?.count())
    }
}
