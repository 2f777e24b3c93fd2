//! Session registry store — the shared, versioned source of truth.
//!
//! Every process behind the load balancer reads and writes the same
//! store. Writes are optimistic: a compare-and-swap succeeds only if the
//! caller saw the latest version. Version 1 is assigned on insert and
//! each successful swap adds exactly 1.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use ferry_core::{SessionId, TransferSession, Versioned};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    AlreadyExists(SessionId),
    #[error("record {0} not found")]
    NotFound(SessionId),
    #[error("stale write: expected version {expected}, found {found}")]
    Stale { expected: u64, found: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new record at version 1.
    async fn insert(
        &self,
        record: &TransferSession,
    ) -> Result<Versioned<TransferSession>, StoreError>;

    async fn load(&self, id: &SessionId)
        -> Result<Option<Versioned<TransferSession>>, StoreError>;

    /// Replace the record if it is still at `expected_version`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &TransferSession,
    ) -> Result<Versioned<TransferSession>, StoreError>;

    /// Returns whether a record was removed.
    async fn remove(&self, id: &SessionId) -> Result<bool, StoreError>;

    /// Snapshot of every record, for the sweeper.
    async fn list(&self) -> Result<Vec<Versioned<TransferSession>>, StoreError>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Records are kept JSON-encoded so a shared `MemoryStore` behaves like a
/// remote store: every reader gets its own decoded copy.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<SessionId, (u64, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn encode(record: &TransferSession) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(record).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn decode(version: u64, bytes: &[u8]) -> Result<Versioned<TransferSession>, StoreError> {
        let record =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Versioned { version, record })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(
        &self,
        record: &TransferSession,
    ) -> Result<Versioned<TransferSession>, StoreError> {
        let bytes = Self::encode(record)?;
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(record.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert((1, bytes));
                Ok(Versioned {
                    version: 1,
                    record: record.clone(),
                })
            }
        }
    }

    async fn load(
        &self,
        id: &SessionId,
    ) -> Result<Option<Versioned<TransferSession>>, StoreError> {
        // Copy out before decoding so the shard lock is released quickly.
        let raw = self.records.get(id).map(|e| (e.0, e.1.clone()));
        match raw {
            Some((version, bytes)) => Self::decode(version, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        record: &TransferSession,
    ) -> Result<Versioned<TransferSession>, StoreError> {
        let bytes = Self::encode(record)?;
        let mut entry = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if entry.0 != expected_version {
            return Err(StoreError::Stale {
                expected: expected_version,
                found: entry.0,
            });
        }
        entry.0 += 1;
        entry.1 = bytes;
        Ok(Versioned {
            version: entry.0,
            record: record.clone(),
        })
    }

    async fn remove(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.records.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Versioned<TransferSession>>, StoreError> {
        let raw: Vec<(u64, Vec<u8>)> = self
            .records
            .iter()
            .map(|e| (e.value().0, e.value().1.clone()))
            .collect();
        raw.iter()
            .map(|(version, bytes)| Self::decode(*version, bytes))
            .collect()
    }
}
