//! A byte-prefix subspace, the unit every key this crate writes is rooted at.
//!
//! Mirrors the directory-layer glossary entry: "a byte-prefix range within the KV store,
//! reserved for one logical scope; keys within a subspace share that prefix."

use crate::codec::{self, Value};

/// A reserved byte-prefix range. Cheap to clone; all methods are pure functions of the prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subspace(Vec<u8>);

impl Subspace {
    /// Wraps a raw prefix (as allocated by the directory layer) as a subspace.
    pub fn new(prefix: Vec<u8>) -> Self {
        Self(prefix)
    }

    /// Returns the raw prefix bytes.
    pub fn prefix(&self) -> &[u8] {
        &self.0
    }

    /// Returns a child subspace nested under a literal byte segment, e.g. `S.R` or `S._meta`.
    pub fn child(&self, segment: &[u8]) -> Self {
        let mut out = self.0.clone();
        out.extend_from_slice(segment);
        Self(out)
    }

    /// Returns the key for a child tuple packed under this subspace, e.g.
    /// `S.R.<packedPrimaryKey>`.
    pub fn pack(&self, tuple: &[Value]) -> Vec<u8> {
        let mut out = self.0.clone();
        out.extend_from_slice(&codec::pack(tuple));
        out
    }

    /// Returns the half-open byte range `[begin, end)` covering every key in this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        (self.0.clone(), strinc(&self.0))
    }
}

/// Returns the smallest byte string that is strictly greater than every string with `prefix` as
/// a prefix, i.e. the exclusive upper bound of the `prefix`-rooted range.
///
/// Implemented by incrementing the last byte that isn't `0xFF` and truncating everything after
/// it; if `prefix` is empty or all `0xFF`, there is no finite such bound below the key space
/// ceiling, so a maximal sentinel is returned instead.
pub fn strinc(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xFF {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return out;
        }
    }
    // `prefix` was empty or all 0xFF: fall back to a key no real subspace prefix can reach.
    vec![0xFF; 32]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_covers_children_but_not_siblings() {
        let s = Subspace::new(b"app.users".to_vec());
        let (begin, end) = s.range();
        let child = s.pack(&[Value::Int(5)]);
        let sibling = b"app.usersx".to_vec();
        assert!(child.as_slice() >= begin.as_slice() && child.as_slice() < end.as_slice());
        assert!(sibling.as_slice() >= end.as_slice());
    }

    #[test]
    fn strinc_handles_trailing_ff() {
        let prefix = vec![0x01, 0xFF, 0xFF];
        assert_eq!(strinc(&prefix), vec![0x02]);
    }
}
