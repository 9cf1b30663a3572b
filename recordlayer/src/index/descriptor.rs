//! Index descriptors: the declarative shape of a secondary index, independent of any particular
//! record type's Rust representation.

use crate::codec::{Tuple, Value};
use crate::error::{Error, Result};

/// How an index's key is derived from a record's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldExpr {
    /// A single scalar field.
    Field(String),
    /// Several scalar fields concatenated into one composite key, in the given order.
    Composite(Vec<String>),
    /// A field holding a tuple of values; one index entry is produced per element.
    ArrayField(String),
    /// Two scalar fields, canonicalized to `(min, max)`; used by symmetric mutual indexes so that
    /// `(A, B)` and `(B, A)` collapse to the same key.
    CanonicalPair(String, String),
}

/// The structural category of an index, used by the maintainer and the planner to decide how an
/// index is built and scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// A single-field scalar index.
    Scalar,
    /// A multi-field composite scalar index.
    Composite,
    /// An array fan-out index: one entry per array element.
    ArrayFanOut,
    /// One half of a paired forward/reverse mutual index.
    Mutual,
    /// An index maintained by application-supplied logic outside this crate's built-in kinds.
    Pluggable,
}

/// When and how a unique index enforces uniqueness: `isUnique=false` only ever pairs with `Skip`;
/// any other pairing
/// with `isUnique=false` is a [`Error::SchemaMismatch`], and `isUnique=true` may not pair with
/// `Skip` either, since a unique index that performs no uniqueness check at all is not a
/// meaningful configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniquenessCheckMode {
    /// Violations in `readable` state fail the write immediately.
    Immediate,
    /// Violations are always recorded and never fail the write, in any state.
    Track,
    /// No uniqueness check is performed. Only legal when `isUnique=false`.
    Skip,
}

/// The declarative definition of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// The index's name, unique within its record type; also the subspace segment under
    /// `S.I.<name>`.
    pub name: String,
    /// The index's structural kind.
    pub kind: IndexKind,
    /// How the index key is computed from a record's fields.
    pub root_expression: FieldExpr,
    /// Whether the index enforces a one-to-one mapping from index key to primary key.
    pub is_unique: bool,
    /// How uniqueness is enforced, constrained against `is_unique` (see
    /// [`IndexDescriptor::new`]).
    pub uniqueness_check_mode: UniquenessCheckMode,
    /// Field names whose values are packed into the index entry's value (rather than an empty
    /// value), enabling index-only scans. Empty for a non-covering index.
    pub covering_fields: Vec<String>,
}

impl IndexDescriptor {
    /// Builds a descriptor, validating the `is_unique` / `uniqueness_check_mode` cross-product.
    pub fn new(
        name: impl Into<String>,
        kind: IndexKind,
        root_expression: FieldExpr,
        is_unique: bool,
        uniqueness_check_mode: UniquenessCheckMode,
    ) -> Result<Self> {
        let name = name.into();
        match (is_unique, uniqueness_check_mode) {
            (false, UniquenessCheckMode::Skip) => {}
            (false, _) => {
                return Err(Error::SchemaMismatch(format!(
                    "index `{}` is not unique but declares uniqueness check mode {:?}; \
                     non-unique indexes must use `Skip`",
                    name, uniqueness_check_mode
                )))
            }
            (true, UniquenessCheckMode::Skip) => {
                return Err(Error::SchemaMismatch(format!(
                    "index `{}` is unique but declares `Skip`; a unique index must check \
                     either `Immediate` or `Track`",
                    name
                )))
            }
            (true, _) => {}
        }
        Ok(Self {
            name,
            kind,
            root_expression,
            is_unique,
            uniqueness_check_mode,
            covering_fields: Vec::new(),
        })
    }

    /// Attaches covering fields, enabling index-only scans for queries that only need these
    /// fields.
    pub fn with_covering_fields(mut self, fields: Vec<String>) -> Self {
        self.covering_fields = fields;
        self
    }

    /// Computes this index's key(s) for one record's decoded fields. Array fan-out expressions
    /// yield one tuple per element; any other expression yields exactly one tuple, unless a
    /// named field is absent, in which case no entries are produced (mirroring `old`/`new` being
    /// absent in the diff-based maintainer).
    pub fn index_keys(&self, fields: &[(String, Value)]) -> Vec<Tuple> {
        let lookup = |name: &str| fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
        match &self.root_expression {
            FieldExpr::Field(name) => lookup(name).map(|v| vec![v]).into_iter().collect(),
            FieldExpr::Composite(names) => {
                let values: Option<Vec<Value>> = names.iter().map(|n| lookup(n)).collect();
                values.into_iter().collect::<Vec<_>>()
            }
            FieldExpr::ArrayField(name) => match lookup(name) {
                Some(Value::Tuple(elements)) => elements.into_iter().map(|v| vec![v]).collect(),
                _ => Vec::new(),
            },
            FieldExpr::CanonicalPair(a, b) => match (lookup(a), lookup(b)) {
                (Some(a), Some(b)) => {
                    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                    vec![vec![lo, hi]]
                }
                _ => Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_unique_requires_skip_mode() {
        let err = IndexDescriptor::new(
            "idx",
            IndexKind::Scalar,
            FieldExpr::Field("a".into()),
            false,
            UniquenessCheckMode::Immediate,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn unique_rejects_skip_mode() {
        let err = IndexDescriptor::new(
            "idx",
            IndexKind::Scalar,
            FieldExpr::Field("a".into()),
            true,
            UniquenessCheckMode::Skip,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn unique_immediate_and_track_are_legal() {
        assert!(IndexDescriptor::new(
            "idx",
            IndexKind::Scalar,
            FieldExpr::Field("a".into()),
            true,
            UniquenessCheckMode::Immediate,
        )
        .is_ok());
        assert!(IndexDescriptor::new(
            "idx",
            IndexKind::Scalar,
            FieldExpr::Field("a".into()),
            true,
            UniquenessCheckMode::Track,
        )
        .is_ok());
    }

    #[test]
    fn array_fan_out_yields_one_entry_per_element() {
        let descriptor = IndexDescriptor::new(
            "tags",
            IndexKind::ArrayFanOut,
            FieldExpr::ArrayField("tags".into()),
            true,
            UniquenessCheckMode::Immediate,
        )
        .unwrap();
        let fields = vec![(
            "tags".to_string(),
            Value::Tuple(vec![
                Value::Str("a".into()),
                Value::Str("b".into()),
                Value::Str("c".into()),
            ]),
        )];
        let keys = descriptor.index_keys(&fields);
        assert_eq!(
            keys,
            vec![
                vec![Value::Str("a".into())],
                vec![Value::Str("b".into())],
                vec![Value::Str("c".into())],
            ]
        );
    }
}
