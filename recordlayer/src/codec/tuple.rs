//! The byte/tuple codec.
//!
//! Packs heterogeneous sequences of [`Value`]s into byte strings whose lexicographic order
//! matches the natural, field-wise order of the source tuples, and unpacks them back. This is
//! the primitive every key this crate writes is built from: record primary keys, index keys, and
//! the `_meta` subspace keys all go through [`pack`]/[`unpack`].

use std::cmp::Ordering;
use std::convert::TryFrom;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A single typed field value, as accepted by the tuple codec.
///
/// `Null` sorts below every other value regardless of what type it is compared against, per the
/// data model's invariant that "null sorts below any non-null value".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// The absence of a value. Distinct from an empty string or empty byte array.
    Null,
    /// A signed integer, up to 64 bits.
    Int(i64),
    /// A UTF-8 string.
    Str(String),
    /// An opaque byte array.
    Bytes(Vec<u8>),
    /// A 128-bit UUID.
    Uuid(Uuid),
    /// A boolean.
    Bool(bool),
    /// A nested tuple, for composite field values.
    Tuple(Vec<Value>),
}

/// A sequence of [`Value`]s, e.g. a primary key or an index key.
pub type Tuple = Vec<Value>;

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        pack_one(self, 0).cmp(&pack_one(other, 0))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

const TAG_NULL: u8 = 0x00;
const TAG_BYTES: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_NESTED: u8 = 0x03;
const TAG_INT: u8 = 0x04;
const TAG_BOOL: u8 = 0x05;
const TAG_UUID: u8 = 0x06;

/// Packs a tuple of values into a sortable byte string.
///
/// For any two tuples `a, b` sharing the same schema (same arity, same per-position types),
/// `a <= b` field-wise implies `pack(a) <= pack(b)` byte-lexicographically, and vice versa.
pub fn pack(tuple: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in tuple {
        encode_value(value, 0, &mut out);
    }
    out
}

fn pack_one(value: &Value, depth: usize) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(value, depth, &mut out);
    out
}

fn encode_value(value: &Value, depth: usize, out: &mut Vec<u8>) {
    match value {
        Value::Null => {
            out.push(TAG_NULL);
            if depth > 0 {
                // Disambiguate from the nested-tuple terminator (a lone 0x00).
                out.push(0xFF);
            }
        }
        Value::Bytes(bytes) => {
            out.push(TAG_BYTES);
            encode_escaped(bytes, out);
        }
        Value::Str(s) => {
            out.push(TAG_STRING);
            encode_escaped(s.as_bytes(), out);
        }
        Value::Tuple(items) => {
            out.push(TAG_NESTED);
            for item in items {
                encode_value(item, depth + 1, out);
            }
            out.push(TAG_NULL); // terminator: a lone 0x00, never followed by 0xFF here
        }
        Value::Int(n) => {
            out.push(TAG_INT);
            // Flip the sign bit so two's-complement ordering becomes unsigned big-endian
            // ordering: the most negative i64 maps to 0x00.., zero to 0x80.., the most
            // positive to 0xFF...
            let flipped = (*n as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Uuid(u) => {
            out.push(TAG_UUID);
            out.extend_from_slice(u.as_bytes());
        }
    }
}

/// Escapes `0x00` bytes as `0x00 0xFF` and appends a `0x00 0x00` terminator, so that the
/// resulting byte string sorts identically to the unescaped input while remaining
/// self-delimiting inside a larger packed tuple.
fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Unpacks a byte string produced by [`pack`] back into its source tuple.
///
/// Fails with [`Error::MalformedTuple`] if `bytes` is not a valid encoding.
pub fn unpack(bytes: &[u8]) -> Result<Tuple> {
    let mut cursor = 0usize;
    let mut out = Vec::new();
    while cursor < bytes.len() {
        let (value, next) = decode_value(bytes, cursor, 0)?;
        out.push(value);
        cursor = next;
    }
    Ok(out)
}

fn decode_value(bytes: &[u8], pos: usize, depth: usize) -> Result<(Value, usize)> {
    let tag = *bytes
        .get(pos)
        .ok_or_else(|| Error::malformed_tuple("unexpected end of input while reading tag"))?;
    match tag {
        TAG_NULL => {
            if depth > 0 {
                match bytes.get(pos + 1) {
                    Some(0xFF) => Ok((Value::Null, pos + 2)),
                    _ => Err(Error::malformed_tuple(
                        "encountered nested-tuple terminator while decoding a value",
                    )),
                }
            } else {
                Ok((Value::Null, pos + 1))
            }
        }
        TAG_BYTES => {
            let (raw, next) = decode_escaped(bytes, pos + 1)?;
            Ok((Value::Bytes(raw), next))
        }
        TAG_STRING => {
            let (raw, next) = decode_escaped(bytes, pos + 1)?;
            let s = String::from_utf8(raw)
                .map_err(|err| Error::malformed_tuple(format!("invalid utf-8: {}", err)))?;
            Ok((Value::Str(s), next))
        }
        TAG_NESTED => {
            let mut items = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match bytes.get(cursor) {
                    None => {
                        return Err(Error::malformed_tuple(
                            "unterminated nested tuple".to_string(),
                        ))
                    }
                    Some(&TAG_NULL) if bytes.get(cursor + 1) != Some(&0xFF) => {
                        cursor += 1;
                        break;
                    }
                    _ => {
                        let (value, next) = decode_value(bytes, cursor, depth + 1)?;
                        items.push(value);
                        cursor = next;
                    }
                }
            }
            Ok((Value::Tuple(items), cursor))
        }
        TAG_INT => {
            let end = pos + 9;
            let raw = bytes
                .get(pos + 1..end)
                .ok_or_else(|| Error::malformed_tuple("truncated integer"))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            let flipped = u64::from_be_bytes(buf);
            let n = (flipped ^ 0x8000_0000_0000_0000) as i64;
            Ok((Value::Int(n), end))
        }
        TAG_BOOL => {
            let b = *bytes
                .get(pos + 1)
                .ok_or_else(|| Error::malformed_tuple("truncated boolean"))?;
            Ok((Value::Bool(b != 0), pos + 2))
        }
        TAG_UUID => {
            let end = pos + 17;
            let raw = bytes
                .get(pos + 1..end)
                .ok_or_else(|| Error::malformed_tuple("truncated uuid"))?;
            let mut buf = [0u8; 16];
            buf.copy_from_slice(raw);
            Ok((Value::Uuid(Uuid::from_bytes(buf)), end))
        }
        other => Err(Error::malformed_tuple(format!("unknown tag byte {:#x}", other))),
    }
}

fn decode_escaped(bytes: &[u8], start: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut cursor = start;
    loop {
        match bytes.get(cursor) {
            None => return Err(Error::malformed_tuple("unterminated byte string")),
            Some(0x00) => match bytes.get(cursor + 1) {
                Some(0xFF) => {
                    out.push(0x00);
                    cursor += 2;
                }
                Some(0x00) | None => {
                    return Ok((out, cursor + 2));
                }
                Some(other) => {
                    return Err(Error::malformed_tuple(format!(
                        "invalid escape sequence 0x00 0x{:02x}",
                        other
                    )))
                }
            },
            Some(&b) => {
                out.push(b);
                cursor += 1;
            }
        }
    }
}

/// Returns a primary-key [`Tuple`] built from a single integer, for callers that want a terse
/// constructor (keys are compared structurally regardless of how they were built).
pub fn pk(value: impl Into<Value>) -> Tuple {
    vec![value.into()]
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(Error::malformed_tuple(format!(
                "expected an integer, found {:?}",
                other
            ))),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(Error::malformed_tuple(format!(
                "expected a string, found {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Int),
            ".*".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
            any::<bool>().prop_map(Value::Bool),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            proptest::collection::vec(inner, 0..4).prop_map(Value::Tuple)
        })
    }

    fn arb_tuple() -> impl Strategy<Value = Tuple> {
        proptest::collection::vec(arb_value(), 0..6)
    }

    proptest! {
        #[test]
        fn round_trip(tuple in arb_tuple()) {
            let packed = pack(&tuple);
            let unpacked = unpack(&packed).unwrap();
            prop_assert_eq!(tuple, unpacked);
        }

        #[test]
        fn ordering_matches_natural_order(a in arb_tuple(), b in arb_tuple()) {
            let pa = pack(&a);
            let pb = pack(&b);
            prop_assert_eq!(a.cmp(&b), pa.cmp(&pb));
        }

        #[test]
        fn int_ordering(a in any::<i64>(), b in any::<i64>()) {
            let pa = pack(&[Value::Int(a)]);
            let pb = pack(&[Value::Int(b)]);
            prop_assert_eq!(a.cmp(&b), pa.cmp(&pb));
        }
    }

    #[test]
    fn null_sorts_before_everything() {
        let null = pack(&[Value::Null]);
        let zero = pack(&[Value::Int(0)]);
        let empty_str = pack(&[Value::Str(String::new())]);
        let empty_bytes = pack(&[Value::Bytes(Vec::new())]);
        assert!(null < zero);
        assert!(null < empty_str);
        assert!(null < empty_bytes);
    }

    #[test]
    fn empty_string_differs_from_null() {
        let null = pack(&[Value::Null]);
        let empty = pack(&[Value::Str(String::new())]);
        assert_ne!(null, empty);
        assert_eq!(unpack(&empty).unwrap(), vec![Value::Str(String::new())]);
    }

    #[test]
    fn malformed_bytes_fail_to_unpack() {
        let bad = vec![0x01, b'a', 0x00, 0x05]; // dangling escape introducer
        assert!(unpack(&bad).is_err());
    }

    #[test]
    fn nested_tuple_round_trips_and_sorts() {
        let a = vec![Value::Tuple(vec![Value::Int(1), Value::Str("x".into())])];
        let b = vec![Value::Tuple(vec![Value::Int(1), Value::Str("y".into())])];
        assert_eq!(unpack(&pack(&a)).unwrap(), a);
        assert!(pack(&a) < pack(&b));
    }

    #[test]
    fn tuple_prefix_does_not_reorder_longer_tuple() {
        // ("a",) < ("a", "b") because the terminator byte for the first string makes
        // "a" + terminator sort before "a" + terminator + more content.
        let short = vec![Value::Str("a".into())];
        let long = vec![Value::Str("a".into()), Value::Str("b".into())];
        assert!(pack(&short) < pack(&long));
    }
}
