//! The index state manager.
//!
//! Index state is persisted at `S._meta.indexState.<name>` as a single tag byte, fronted by a
//! single-instance in-process cache. Invalidation on write is mandatory: the same
//! [`IndexStateManager`] instance must be used for reads and writes that need to observe each
//! other, since a different instance would have a stale cache.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::kv::Transaction;
use crate::subspace::Subspace;

/// The lifecycle state of a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    /// Not maintained; may not be read.
    Disabled,
    /// Maintained on every write, but not yet safe to read (an online build may be in flight, or
    /// uniqueness violations from a prior build remain unresolved).
    WriteOnly,
    /// Maintained and safe to read.
    Readable,
}

const TAG_DISABLED: u8 = 0x00;
const TAG_WRITE_ONLY: u8 = 0x01;
const TAG_READABLE: u8 = 0x02;

impl IndexState {
    fn encode(self) -> u8 {
        match self {
            IndexState::Disabled => TAG_DISABLED,
            IndexState::WriteOnly => TAG_WRITE_ONLY,
            IndexState::Readable => TAG_READABLE,
        }
    }

    fn decode(byte: u8) -> Result<Self> {
        match byte {
            TAG_DISABLED => Ok(IndexState::Disabled),
            TAG_WRITE_ONLY => Ok(IndexState::WriteOnly),
            TAG_READABLE => Ok(IndexState::Readable),
            other => Err(Error::malformed_tuple(format!(
                "unknown index state tag {:#x}",
                other
            ))),
        }
    }

    /// The legal transitions: `disabled -> writeOnly -> readable`, and either of the non-disabled
    /// states back to `disabled`.
    fn is_legal_transition(from: IndexState, to: IndexState) -> bool {
        matches!(
            (from, to),
            (IndexState::Disabled, IndexState::WriteOnly)
                | (IndexState::WriteOnly, IndexState::Readable)
                | (IndexState::Readable, IndexState::Disabled)
                | (IndexState::WriteOnly, IndexState::Disabled)
        )
    }
}

/// Manages persisted index lifecycle state for one store instance.
pub struct IndexStateManager {
    meta: Subspace,
    cache: RwLock<HashMap<String, IndexState>>,
}

impl IndexStateManager {
    /// Creates a manager persisting state under the given `_meta.indexState` subspace.
    pub fn new(meta: Subspace) -> Self {
        Self {
            meta,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn key(&self, name: &str) -> Vec<u8> {
        self.meta.pack(&[Value::Str(name.to_string())])
    }

    /// Returns the current state of `name`, defaulting to [`IndexState::Disabled`] if no state
    /// has ever been persisted.
    pub async fn state(&self, txn: &dyn Transaction, name: &str) -> Result<IndexState> {
        if let Some(state) = self.cache.read().await.get(name).copied() {
            return Ok(state);
        }
        let state = match txn.get(&self.key(name), false).await? {
            Some(bytes) => {
                let byte = *bytes
                    .first()
                    .ok_or_else(|| Error::malformed_tuple("empty index state value"))?;
                IndexState::decode(byte)?
            }
            None => IndexState::Disabled,
        };
        self.cache.write().await.insert(name.to_string(), state);
        Ok(state)
    }

    async fn transition(&self, txn: &dyn Transaction, name: &str, to: IndexState) -> Result<()> {
        let from = self.state(txn, name).await?;
        if !IndexState::is_legal_transition(from, to) {
            return Err(Error::IndexStateInvalidTransition {
                index_name: name.to_string(),
                from,
                to,
            });
        }
        txn.set(self.key(name), vec![to.encode()]).await;
        self.cache.write().await.insert(name.to_string(), to);
        Ok(())
    }

    /// `disabled → writeOnly`.
    pub async fn enable(&self, txn: &dyn Transaction, name: &str) -> Result<()> {
        self.transition(txn, name, IndexState::WriteOnly).await
    }

    /// `writeOnly → readable`.
    pub async fn make_readable(&self, txn: &dyn Transaction, name: &str) -> Result<()> {
        self.transition(txn, name, IndexState::Readable).await
    }

    /// Any state `→ disabled`.
    pub async fn disable(&self, txn: &dyn Transaction, name: &str) -> Result<()> {
        self.transition(txn, name, IndexState::Disabled).await
    }

    /// Drops the in-process cache entry for `name`, forcing the next [`Self::state`] call to
    /// re-read from the store.
    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}
