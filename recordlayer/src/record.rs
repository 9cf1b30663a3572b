//! The record encoder and the format-version gate applications hit when opening a store written
//! by a different build.
//!
//! Compile-time extraction of a record type's field list, directory path, and index descriptors
//! is left to applications: they implement [`RecordType`] once, by hand or via their own code
//! generator, and everything downstream of it (encoding, indexing, querying) is driven off that
//! single trait.

use serde::{Deserialize, Serialize};

use crate::codec::{self, Tuple, Value};
use crate::error::{Error, Result};
use crate::index::descriptor::IndexDescriptor;

/// A `(major, minor, patch)` format version, persisted at `S._meta.formatVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FormatVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// The format version this build implements.
    pub const CURRENT: FormatVersion = FormatVersion::new(1, 3, 0);

    pub(crate) fn to_tuple(self) -> Tuple {
        vec![
            Value::Int(i64::from(self.major)),
            Value::Int(i64::from(self.minor)),
            Value::Int(i64::from(self.patch)),
        ]
    }

    pub(crate) fn from_tuple(tuple: &[Value]) -> Result<Self> {
        match tuple {
            [Value::Int(major), Value::Int(minor), Value::Int(patch)] => Ok(Self {
                major: *major as u32,
                minor: *minor as u32,
                patch: *patch as u32,
            }),
            other => Err(Error::malformed_tuple(format!(
                "expected a 3-tuple format version, found {:?}",
                other
            ))),
        }
    }
}

/// The outcome of opening a store whose persisted format version differs from
/// [`FormatVersion::CURRENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatGateOutcome {
    /// The persisted version equals the current version; nothing to do.
    UpToDate,
    /// The persisted version is older within the same major version; an idempotent in-place
    /// upgrade was applied.
    Upgraded { from: FormatVersion, to: FormatVersion },
}

/// Checks a persisted format version against [`FormatVersion::CURRENT`] and determines whether
/// the store may be opened.
pub fn check_format_version(stored: FormatVersion) -> Result<FormatGateOutcome> {
    let current = FormatVersion::CURRENT;
    if stored.major != current.major {
        return Err(Error::MajorVersionMismatch { stored, current });
    }
    if stored > current {
        return Err(Error::FormatVersionTooNew { stored, current });
    }
    if stored < current {
        Ok(FormatGateOutcome::Upgraded {
            from: stored,
            to: current,
        })
    } else {
        Ok(FormatGateOutcome::UpToDate)
    }
}

/// Implemented once per application record type to expose what this crate needs to store, index,
/// and query it.
///
/// All hot paths resolve a fixed `RecordType` implementation at schema registration; the
/// engine's internal string-keyed lookups (used only on error paths) go through
/// [`RecordType::type_name`].
pub trait RecordType: Sized + Send + Sync + 'static {
    /// A stable, unique name for this record type (used for subspace naming, `_meta` keys, and
    /// diagnostics).
    fn type_name() -> &'static str;

    /// The record's primary key, as a tuple of one or more fields.
    fn primary_key(&self) -> Tuple;

    /// The static segments of this type's directory path. For a type with partition fields,
    /// these are the segments that precede the partition-derived segments.
    fn directory_path() -> Vec<String>;

    /// The names of the partition fields that parameterize this type's directory path, in the
    /// order they are appended to [`RecordType::directory_path`]. Empty for a statically
    /// directoried type.
    fn partition_field_names() -> &'static [&'static str] {
        &[]
    }

    /// This record's partition field values, matching [`RecordType::partition_field_names`] by
    /// position.
    fn partition_values(&self) -> Vec<Value> {
        Vec::new()
    }

    /// The names of [`RecordType::fields`], in the same declaration order. Static so the payload
    /// can be decoded without an instance to call `fields` on.
    fn field_names() -> &'static [&'static str];

    /// All declared non-partition fields, as `(name, value)` pairs in a stable declaration
    /// order. This is what [`RecordEncoder::encode_full`] persists.
    fn fields(&self) -> Vec<(String, Value)>;

    /// Reconstructs a record from its decoded fields (the inverse of
    /// [`RecordType::fields`]/[`RecordType::partition_values`]).
    fn from_fields(partition: Vec<(String, Value)>, fields: Vec<(String, Value)>) -> Result<Self>;

    /// The index descriptors declared for this type.
    fn indexes() -> Vec<IndexDescriptor>;
}

/// Encodes and decodes record payloads.
pub struct RecordEncoder;

impl RecordEncoder {
    /// Full encoding: all of a record's declared non-partition fields, packed as a single tuple.
    pub fn encode_full<T: RecordType>(record: &T) -> Vec<u8> {
        let values: Vec<Value> = record.fields().into_iter().map(|(_, v)| v).collect();
        codec::pack(&values)
    }

    /// Decodes a full encoding back into `(name, value)` pairs, given the field names in the
    /// same declaration order [`RecordType::fields`] produced them in.
    pub fn decode_full(field_names: &[&str], bytes: &[u8]) -> Result<Vec<(String, Value)>> {
        let values = codec::unpack(bytes)?;
        if values.len() != field_names.len() {
            return Err(Error::malformed_tuple(format!(
                "expected {} fields, decoded {}",
                field_names.len(),
                values.len()
            )));
        }
        Ok(field_names
            .iter()
            .map(|n| n.to_string())
            .zip(values)
            .collect())
    }

    /// Covering-value bitmap encoding: a bitmap (one bit per `field_names` entry,
    /// 1 = present) followed by the packed present values in bitmap order. A field is "present"
    /// whenever its value is not [`Value::Null`], which is how an empty string is distinguished
    /// from an absent/null field.
    pub fn encode_covering(field_names: &[&str], fields: &[(String, Value)]) -> Vec<u8> {
        let mut present = Vec::with_capacity(field_names.len());
        let mut present_values = Vec::new();
        for name in field_names {
            let value = fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            match value {
                Value::Null => present.push(false),
                other => {
                    present.push(true);
                    present_values.push(other);
                }
            }
        }
        let mut out = pack_bits(&present);
        out.extend(codec::pack(&present_values));
        out
    }

    /// Decodes a covering-value bitmap encoding back into `(name, value)` pairs; absent fields
    /// decode to [`Value::Null`].
    pub fn decode_covering(field_names: &[&str], bytes: &[u8]) -> Result<Vec<(String, Value)>> {
        let bitmap_len = (field_names.len() + 7) / 8;
        if bytes.len() < bitmap_len {
            return Err(Error::malformed_tuple("covering value shorter than its bitmap"));
        }
        let present = unpack_bits(&bytes[..bitmap_len], field_names.len());
        let values = codec::unpack(&bytes[bitmap_len..])?;
        let mut value_iter = values.into_iter();
        let mut out = Vec::with_capacity(field_names.len());
        for (name, is_present) in field_names.iter().zip(present.iter()) {
            let value = if *is_present {
                value_iter.next().ok_or_else(|| {
                    Error::malformed_tuple("bitmap claimed more present fields than values found")
                })?
            } else {
                Value::Null
            };
            out.push(((*name).to_string(), value));
        }
        Ok(out)
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_version_gate_accepts_equal_and_older_minor() {
        assert_eq!(
            check_format_version(FormatVersion::CURRENT).unwrap(),
            FormatGateOutcome::UpToDate
        );
        let older = FormatVersion::new(1, 0, 0);
        assert_eq!(
            check_format_version(older).unwrap(),
            FormatGateOutcome::Upgraded {
                from: older,
                to: FormatVersion::CURRENT
            }
        );
    }

    #[test]
    fn format_version_gate_rejects_major_mismatch_and_newer() {
        assert!(matches!(
            check_format_version(FormatVersion::new(2, 0, 0)),
            Err(Error::MajorVersionMismatch { .. })
        ));
        assert!(matches!(
            check_format_version(FormatVersion::new(1, 99, 0)),
            Err(Error::FormatVersionTooNew { .. })
        ));
    }

    #[test]
    fn covering_value_distinguishes_null_from_empty_string() {
        let fields = vec![
            ("a".to_string(), Value::Str(String::new())),
            ("b".to_string(), Value::Null),
        ];
        let encoded = RecordEncoder::encode_covering(&["a", "b"], &fields);
        let decoded = RecordEncoder::decode_covering(&["a", "b"], &encoded).unwrap();
        assert_eq!(decoded[0], ("a".to_string(), Value::Str(String::new())));
        assert_eq!(decoded[1], ("b".to_string(), Value::Null));
    }

    #[test]
    fn covering_value_round_trips_all_present() {
        let field_names = ["x", "y", "z"];
        let fields = vec![
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::Int(2)),
            ("z".to_string(), Value::Int(3)),
        ];
        let encoded = RecordEncoder::encode_covering(&field_names, &fields);
        let decoded = RecordEncoder::decode_covering(&field_names, &encoded).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn full_encoding_round_trips() {
        let field_names = ["id", "email"];
        let fields = vec![
            ("id".to_string(), Value::Str("U1".into())),
            ("email".to_string(), Value::Str("a@x".into())),
        ];
        let values: Vec<Value> = fields.iter().map(|(_, v)| v.clone()).collect();
        let bytes = codec::pack(&values);
        let decoded = RecordEncoder::decode_full(&field_names, &bytes).unwrap();
        assert_eq!(decoded, fields);
    }
}
