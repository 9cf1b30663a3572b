//! Byte/tuple codec and the `BinaryValue` trait used by the record encoder.

mod tuple;

use std::borrow::Cow;

pub use tuple::{pack, pk, unpack, Tuple, Value};

use crate::error::Result;

/// Implemented by types that can be persisted as an opaque byte blob, as opposed to a sortable
/// tuple. Field values that participate in a primary or index key go through [`Value`] instead;
/// `BinaryValue` is for whole-record payloads and for covering-index values.
pub trait BinaryValue: Sized {
    /// Serializes `self` to an owned byte vector.
    fn to_bytes(&self) -> Vec<u8>;

    /// Deserializes a value previously produced by [`BinaryValue::to_bytes`].
    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self>;
}

impl BinaryValue for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self> {
        Ok(bytes.into_owned())
    }
}

impl BinaryValue for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: Cow<'_, [u8]>) -> Result<Self> {
        String::from_utf8(bytes.into_owned())
            .map_err(|err| crate::Error::malformed_tuple(err.to_string()))
    }
}
