//! The large-value splitter.
//!
//! Values larger than [`SplitConfig::max_value_size`] are broken into numbered parts stored
//! under a distinct blobs subspace; a small header at the record's base key records how many
//! parts to reassemble and in what order. Values at or below the threshold are stored as a
//! single entry with no header, so the common case pays no overhead.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// Configuration for the large-value splitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Values larger than this (in bytes) are split into parts. Defaults to ~90 KiB, matching
    /// the external store's per-value size guidance this crate targets.
    pub max_value_size: usize,
    /// When `false`, every value is stored as a single entry regardless of size (the caller is
    /// responsible for staying under the store's hard per-value limit in that case).
    pub enabled: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_value_size: 90 * 1024,
            enabled: true,
        }
    }
}

const MAGIC: u8 = 0xFF;
const HEADER_VERSION: u8 = 1;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const HEADER_LEN: usize = 1 + 1 + 4 + 2 + 1; // magic, version, total_len, part_count, flags
const MAX_PARTS: usize = 254;

struct Header {
    total_len: u32,
    part_count: u16,
    compressed: bool,
}

fn encode_header(header: &Header) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.push(MAGIC);
    out.push(HEADER_VERSION);
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, header.total_len);
    out.extend_from_slice(&len_buf);
    let mut count_buf = [0u8; 2];
    BigEndian::write_u16(&mut count_buf, header.part_count);
    out.extend_from_slice(&count_buf);
    out.push(if header.compressed { FLAG_COMPRESSED } else { 0 });
    out
}

fn decode_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN || bytes[0] != MAGIC {
        return Err(Error::malformed_tuple("not a large-value header"));
    }
    let total_len = BigEndian::read_u32(&bytes[2..6]);
    let part_count = BigEndian::read_u16(&bytes[6..8]);
    let compressed = bytes[8] & FLAG_COMPRESSED != 0;
    Ok(Header {
        total_len,
        part_count,
        compressed,
    })
}

fn is_header(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes[0] == MAGIC
}

fn part_key(blobs: &Subspace, pk: &[Value], part_index: u16) -> Vec<u8> {
    let mut tuple = pk.to_vec();
    tuple.push(Value::Int(i64::from(part_index)));
    blobs.pack(&tuple)
}

fn pk_blob_range(blobs: &Subspace, pk: &[Value]) -> (Vec<u8>, Vec<u8>) {
    Subspace::new(blobs.pack(pk)).range()
}

/// Splits and reassembles large values.
///
/// The splitter treats `value` as already-prepared opaque bytes: callers (the item storage
/// layer) decide whether to compress first and pass `compressed` through purely so it
/// can be recorded in the header for [`Splitter::is_split`]/[`Splitter::get_size`] consumers.
/// Every value the splitter is given is expected to carry its own leading discriminant byte from
/// the caller (never `0xFF`), so that a stored header can always be told apart from a raw,
/// unsplit value by inspecting the first byte.
#[derive(Debug, Clone)]
pub struct Splitter {
    config: SplitConfig,
}

impl Splitter {
    /// Creates a splitter with the given configuration.
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// Writes `value` at `base_key`, splitting into parts under `blobs` if it exceeds the
    /// configured threshold. Always clears any previously written parts first.
    pub async fn write(
        &self,
        txn: &dyn Transaction,
        base_key: Vec<u8>,
        blobs: &Subspace,
        pk: &[Value],
        value: &[u8],
        compressed: bool,
    ) -> Result<()> {
        self.delete(txn, &base_key, blobs, pk).await?;

        if !self.config.enabled || value.len() <= self.config.max_value_size {
            txn.set(base_key, value.to_vec()).await;
            return Ok(());
        }

        let part_size = self.config.max_value_size.max(1);
        let part_count = (value.len() + part_size - 1) / part_size;
        if part_count > MAX_PARTS {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                parts: part_count,
            });
        }

        let header = encode_header(&Header {
            total_len: value.len() as u32,
            part_count: part_count as u16,
            compressed,
        });
        txn.set(base_key, header).await;

        for (index, chunk) in value.chunks(part_size).enumerate() {
            let key = part_key(blobs, pk, index as u16);
            txn.set(key, chunk.to_vec()).await;
        }
        Ok(())
    }

    /// Reads and reassembles the value at `base_key`, or `None` if it doesn't exist. `snapshot`
    /// controls whether the underlying reads add to the transaction's conflict range.
    pub async fn read(
        &self,
        txn: &dyn Transaction,
        base_key: &[u8],
        blobs: &Subspace,
        pk: &[Value],
        snapshot: bool,
    ) -> Result<Option<(Vec<u8>, bool)>> {
        let base = match txn.get(base_key, snapshot).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        if !is_header(&base) {
            return Ok(Some((base, false)));
        }
        let header = decode_header(&base)?;
        let mut value = Vec::with_capacity(header.total_len as usize);
        for index in 0..header.part_count {
            let key = part_key(blobs, pk, index);
            let chunk = txn.get(&key, snapshot).await?.ok_or_else(|| {
                Error::malformed_tuple(format!("missing blob part {} for a split value", index))
            })?;
            value.extend_from_slice(&chunk);
        }
        if value.len() != header.total_len as usize {
            return Err(Error::malformed_tuple(
                "reassembled value length does not match header",
            ));
        }
        Ok(Some((value, header.compressed)))
    }

    /// Deletes the value (and any parts) at `base_key`.
    pub async fn delete(
        &self,
        txn: &dyn Transaction,
        base_key: &[u8],
        blobs: &Subspace,
        pk: &[Value],
    ) -> Result<()> {
        txn.clear(base_key.to_vec()).await;
        let (begin, end) = pk_blob_range(blobs, pk);
        txn.clear_range(begin, end).await;
        Ok(())
    }

    /// Returns `true` if the value at `base_key` is currently split into parts.
    pub async fn is_split(&self, txn: &dyn Transaction, base_key: &[u8]) -> Result<bool> {
        Ok(txn
            .get(base_key, false)
            .await?
            .map_or(false, |bytes| is_header(&bytes)))
    }

    /// Returns the logical size of the value at `base_key`, without reading its parts.
    pub async fn get_size(&self, txn: &dyn Transaction, base_key: &[u8]) -> Result<Option<usize>> {
        let base = match txn.get(base_key, false).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        if is_header(&base) {
            Ok(Some(decode_header(&base)?.total_len as usize))
        } else {
            Ok(Some(base.len()))
        }
    }
}
