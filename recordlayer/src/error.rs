//! The error taxonomy for the record layer.
//!
//! Application code in most cases should match on [`Error`] only to decide whether to retry
//! (see [`Error::is_retryable`]); the context fields exist for diagnostics and for callers that
//! need to present a specific failure to a user (e.g. a uniqueness conflict).

use std::time::SystemTime;

use thiserror::Error;

use crate::codec::Value;

/// A specialized `Result` type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type produced by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    // --- Transient / retryable -------------------------------------------------------------
    /// The underlying store detected a conflict between this transaction's read set and a
    /// concurrently committed write set.
    #[error("transaction conflict")]
    Conflict,

    /// The transaction's read version is older than the store's retention window.
    #[error("transaction is too old")]
    TransactionTooOld,

    /// The transaction's accumulated mutations exceed the store's per-transaction size limit.
    #[error("transaction is too large")]
    TransactionTooLarge,

    /// The commit was sent but the store could not confirm whether it was applied.
    #[error("commit result is unknown")]
    CommitUnknownResult,

    /// A network-level timeout talking to the underlying store.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    // --- Validation --------------------------------------------------------------------------
    /// A query, fetch, delete-all, or enumerate was issued against a dynamic-directory record
    /// type without a complete partition binding.
    #[error("missing partition binding for field `{field}` on type `{type_name}`")]
    MissingPartitionBinding {
        /// The record type the operation targeted.
        type_name: String,
        /// The partition field that was left unbound.
        field: String,
    },

    /// A tuple could not be unpacked from its byte representation.
    #[error("malformed tuple: {0}")]
    MalformedTuple(String),

    /// A value exceeded the maximum number of large-value parts (254).
    #[error("value of {size} bytes would require {parts} parts, exceeding the limit of 254")]
    ValueTooLarge {
        /// The value size in bytes.
        size: usize,
        /// The number of parts that would have been required.
        parts: usize,
    },

    /// A directory path could not be resolved or manipulated as requested.
    #[error("directory path error: {0}")]
    DirectoryPathError(String),

    /// A record or index descriptor was configured inconsistently.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // --- Consistency -------------------------------------------------------------------------
    /// A unique index in `readable` state rejected a write that would have produced a duplicate
    /// index key.
    #[error(
        "uniqueness violation on index `{index_name}` of type `{type_name}`: \
         primary key {new_pk:?} conflicts with existing {existing_pk:?} for values {conflicting_values:?}"
    )]
    UniquenessViolation {
        /// The name of the violated index.
        index_name: String,
        /// The record type the index belongs to.
        type_name: String,
        /// The index-key field values that collided.
        conflicting_values: Vec<Value>,
        /// The primary key already owning the index entry.
        existing_pk: Vec<Value>,
        /// The primary key that attempted to claim the same entry.
        new_pk: Vec<Value>,
    },

    /// An index state transition was requested that is not in the legal transition set.
    #[error("invalid index state transition for `{index_name}`: {from:?} -> {to:?}")]
    IndexStateInvalidTransition {
        /// The index whose state transition was rejected.
        index_name: String,
        /// The state the index was in.
        from: crate::index::state::IndexState,
        /// The state that was requested.
        to: crate::index::state::IndexState,
    },

    /// An online index build finished its scan but found unresolved uniqueness violations; the
    /// index is left in `writeOnly` for operator resolution rather than promoted to `readable`.
    #[error(
        "index `{index_name}` has {violation_count} unresolved uniqueness violations across \
         {total_conflicting_records} conflicting records; left in writeOnly"
    )]
    UniquenessViolationsDetected {
        /// The index whose build could not be promoted to `readable`.
        index_name: String,
        /// The number of distinct conflicting value keys.
        violation_count: usize,
        /// The total number of conflicting records across all violations.
        total_conflicting_records: usize,
    },

    // --- Capacity / budget -------------------------------------------------------------------
    /// The query planner's structural complexity budget was exceeded.
    #[error("plan complexity {actual} exceeds threshold {threshold}")]
    PlanComplexityExceeded {
        /// The computed complexity of the cheapest plan found.
        actual: u64,
        /// The configured threshold.
        threshold: u64,
    },

    /// The query planner enumerated more candidate plans than permitted.
    #[error("plan enumeration count {count} exceeds limit {limit}")]
    PlanEnumerationsExceeded {
        /// The number of plans enumerated before the limit was hit.
        count: u64,
        /// The configured limit.
        limit: u64,
    },

    /// The query planner applied more rewrite rules than permitted.
    #[error("rule application count {count} exceeds limit {limit}")]
    RuleApplicationsExceeded {
        /// The number of rule applications performed before the limit was hit.
        count: u64,
        /// The configured limit.
        limit: u64,
    },

    /// Planning did not complete within the configured wall-clock budget.
    #[error("planning exceeded timeout of {timeout_seconds}s")]
    PlanningTimeoutExceeded {
        /// The configured timeout, in seconds.
        timeout_seconds: u64,
    },

    // --- Lifecycle ---------------------------------------------------------------------------
    /// A session lock could not be acquired because another holder is live.
    #[error("lock `{session_name}` is held by another session")]
    LockNotAcquired {
        /// The name of the contested lock.
        session_name: String,
    },

    /// A session's lease was lost (stolen, expired, or renewed by a different holder).
    #[error("lock `{session_name}` was lost")]
    LockLost {
        /// The name of the lock that was lost.
        session_name: String,
    },

    /// The persisted lock holder record could not be decoded.
    #[error("invalid lock data for `{session_name}`: {reason}")]
    InvalidLockData {
        /// The name of the lock whose data was invalid.
        session_name: String,
        /// A human-readable description of the decoding failure.
        reason: String,
    },

    // --- Format ------------------------------------------------------------------------------
    /// The persisted format version is older than any version this build knows how to migrate
    /// from.
    #[error("persisted format version {stored:?} is too old for this build")]
    FormatVersionTooOld {
        /// The persisted version.
        stored: crate::record::FormatVersion,
    },

    /// The persisted format version is newer than this build supports.
    #[error("persisted format version {stored:?} is newer than this build's {current:?}")]
    FormatVersionTooNew {
        /// The persisted version.
        stored: crate::record::FormatVersion,
        /// The current version this build implements.
        current: crate::record::FormatVersion,
    },

    /// The persisted major version differs from the current major version.
    #[error("major version mismatch: persisted {stored:?}, current {current:?}")]
    MajorVersionMismatch {
        /// The persisted version.
        stored: crate::record::FormatVersion,
        /// The current version this build implements.
        current: crate::record::FormatVersion,
    },

    /// An idempotent upgrade migration failed partway through.
    #[error("upgrade from {from:?} to {to:?} failed: {reason}")]
    UpgradeFailed {
        /// The version the store was upgrading from.
        from: crate::record::FormatVersion,
        /// The version the store was upgrading to.
        to: crate::record::FormatVersion,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// A feature was used that requires a format version newer than the one persisted.
    #[error("feature `{feature}` requires format version {required:?}, store is at {actual:?}")]
    FeatureNotAvailable {
        /// The feature that was requested.
        feature: String,
        /// The minimum version required.
        required: crate::record::FormatVersion,
        /// The version actually persisted.
        actual: crate::record::FormatVersion,
    },

    // --- Security ------------------------------------------------------------------------------
    /// A security policy rejected an operation.
    #[error("security error: `{operation}` on `{target_type}` denied: {reason}")]
    Security {
        /// The operation that was attempted.
        operation: String,
        /// The record type the operation targeted.
        target_type: String,
        /// A human-readable reason for the denial.
        reason: String,
    },

    /// Catch-all for errors surfaced by an embedding application's `Database`/`Transaction`
    /// implementation that don't map onto a more specific variant above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Creates a [`Error::MalformedTuple`] with the given message.
    pub fn malformed_tuple(message: impl Into<String>) -> Self {
        Self::MalformedTuple(message.into())
    }

    /// Returns `true` if the transaction runner should retry the enclosing transaction after
    /// this error, rather than surface it to the caller.
    ///
    /// This is the transient/retryable partition of the error taxonomy: conflict,
    /// transaction-too-old, transaction-too-large, commit-unknown-result, and network timeouts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict
                | Self::TransactionTooOld
                | Self::TransactionTooLarge
                | Self::CommitUnknownResult
                | Self::NetworkTimeout(_)
        )
    }
}

/// A timestamp recorded alongside violations and lease state; kept as a thin wrapper so call
/// sites read `Timestamp::now()` rather than importing `std::time` directly.
pub type Timestamp = SystemTime;
