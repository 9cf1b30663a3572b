//! Item storage: composes the tuple codec's keys with the splitter, adding transparent
//! compression for values above a configurable threshold.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::kv::Transaction;
use crate::split::{SplitConfig, Splitter};
use crate::subspace::Subspace;

/// Configuration for [`ItemStorage`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Values at or above this size (in bytes, measured before compression) are compressed.
    /// Defaults to 256 bytes: small records rarely compress well enough to offset the CPU cost.
    pub compression_threshold: usize,
    /// The large-value splitter's configuration.
    pub split: SplitConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 256,
            split: SplitConfig::default(),
        }
    }
}

const TAG_RAW: u8 = 0x00;
const TAG_COMPRESSED: u8 = 0x01;

/// Composes the splitter with transparent compression to read/write/delete/check whole-record
/// byte payloads within a transaction.
///
/// Every method takes the transaction handle directly rather than owning one, so index
/// maintainers can issue plain range operations against the same `&dyn Transaction` without
/// needing to "re-enter" this type's compression logic.
#[derive(Debug, Clone)]
pub struct ItemStorage {
    splitter: Splitter,
    compression_threshold: usize,
}

impl ItemStorage {
    /// Creates item storage from the given configuration.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            splitter: Splitter::new(config.split),
            compression_threshold: config.compression_threshold,
        }
    }

    /// Writes `value` at `base_key`, compressing and/or splitting as configured.
    pub async fn write(
        &self,
        txn: &dyn Transaction,
        base_key: Vec<u8>,
        blobs: &Subspace,
        pk: &[Value],
        value: &[u8],
    ) -> Result<()> {
        let (tagged, compressed) = if value.len() >= self.compression_threshold {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(value)
                .map_err(|err| Error::Other(anyhow::anyhow!(err)))?;
            let body = encoder
                .finish()
                .map_err(|err| Error::Other(anyhow::anyhow!(err)))?;
            (tag(TAG_COMPRESSED, &body), true)
        } else {
            (tag(TAG_RAW, value), false)
        };
        self.splitter
            .write(txn, base_key, blobs, pk, &tagged, compressed)
            .await
    }

    /// Reads and decompresses/reassembles the value at `base_key`, or `None` if absent. `snapshot`
    /// controls whether the underlying reads add to the transaction's conflict range.
    pub async fn read(
        &self,
        txn: &dyn Transaction,
        base_key: &[u8],
        blobs: &Subspace,
        pk: &[Value],
        snapshot: bool,
    ) -> Result<Option<Vec<u8>>> {
        let tagged = match self.splitter.read(txn, base_key, blobs, pk, snapshot).await? {
            Some((bytes, _compressed_hint)) => bytes,
            None => return Ok(None),
        };
        let (discriminant, body) = tagged
            .split_first()
            .ok_or_else(|| Error::malformed_tuple("empty stored record payload"))?;
        match *discriminant {
            TAG_RAW => Ok(Some(body.to_vec())),
            TAG_COMPRESSED => {
                let mut decoder = ZlibDecoder::new(body);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|err| Error::malformed_tuple(format!("decompression failed: {}", err)))?;
                Ok(Some(out))
            }
            other => Err(Error::malformed_tuple(format!(
                "unknown item storage discriminant {:#x}",
                other
            ))),
        }
    }

    /// Deletes the value (and any blob parts) at `base_key`.
    pub async fn delete(
        &self,
        txn: &dyn Transaction,
        base_key: &[u8],
        blobs: &Subspace,
        pk: &[Value],
    ) -> Result<()> {
        self.splitter.delete(txn, base_key, blobs, pk).await
    }

    /// Returns `true` if a value is present at `base_key`.
    pub async fn exists(&self, txn: &dyn Transaction, base_key: &[u8]) -> Result<bool> {
        Ok(txn.get(base_key, false).await?.is_some())
    }
}

fn tag(discriminant: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(discriminant);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{Database, TestDatabase};

    fn pk() -> Vec<Value> {
        vec![Value::Str("rec-1".into())]
    }

    #[tokio::test]
    async fn small_values_round_trip_uncompressed() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let storage = ItemStorage::new(StorageConfig::default());
        let blobs = Subspace::new(b"blobs.".to_vec());

        storage
            .write(txn.as_ref(), b"base".to_vec(), &blobs, &pk(), b"small value")
            .await
            .unwrap();
        let value = storage
            .read(txn.as_ref(), b"base", &blobs, &pk(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, b"small value");
        assert!(storage.exists(txn.as_ref(), b"base").await.unwrap());
    }

    #[tokio::test]
    async fn large_values_compress_and_round_trip() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let storage = ItemStorage::new(StorageConfig {
            compression_threshold: 8,
            ..StorageConfig::default()
        });
        let blobs = Subspace::new(b"blobs.".to_vec());
        let value = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();

        storage
            .write(txn.as_ref(), b"base".to_vec(), &blobs, &pk(), &value)
            .await
            .unwrap();
        let read_back = storage
            .read(txn.as_ref(), b"base", &blobs, &pk(), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_back, value);
    }

    #[tokio::test]
    async fn delete_removes_value() {
        let db = TestDatabase::new();
        let txn = db.create_transaction().await;
        let storage = ItemStorage::new(StorageConfig::default());
        let blobs = Subspace::new(b"blobs.".to_vec());
        storage
            .write(txn.as_ref(), b"base".to_vec(), &blobs, &pk(), b"x")
            .await
            .unwrap();
        storage
            .delete(txn.as_ref(), b"base", &blobs, &pk())
            .await
            .unwrap();
        assert!(!storage.exists(txn.as_ref(), b"base").await.unwrap());
    }
}
