//! Durable update log and snapshot storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append/compact  ┌────────────────┐  spawn_blocking  ┌─────────────┐
//! │ SyncEngine   │ ───────────────► │ PersistenceLog │ ───────────────► │ EntryStore  │
//! │ (per-key     │ ◄─────────────── │ (retry+backoff)│ ◄─────────────── │ Rocks/Memory│
//! │  handle)     │   load/resync    └────────────────┘                  └─────────────┘
//! └──────────────┘
//!
//! Entry layout: kind ∈ {snapshot, update} × (wave_id, blip_id) × seq
//! ```
//!
//! Recovery is the replay path only: latest snapshot, then every update with
//! a higher seq, in seq order.

pub mod update_log;
pub mod memory;
pub mod retry;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{DocumentKey, Snapshot, UpdateRecord};

pub use update_log::{LoadError, PersistenceError, PersistenceLog};
pub use memory::MemoryStore;
pub use retry::RetryConfig;
pub use rocks::{RocksStore, StoreConfig};

/// Entry kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    Snapshot = 1,
    Update = 2,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Snapshot => write!(f, "snapshot"),
            EntryKind::Update => write!(f, "update"),
        }
    }
}

/// One persisted entry, either an update record or a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub kind: EntryKind,
    pub key: DocumentKey,
    pub seq: u64,
    /// Delta envelope for updates, state envelope for snapshots
    pub blob: Vec<u8>,
    /// Submitting client; empty for snapshots
    pub origin: String,
    /// Submitter's idempotency key; 0 for snapshots
    pub client_seq: u64,
    /// `received_at` for updates, `updated_at` for snapshots
    pub timestamp: u64,
}

impl From<&UpdateRecord> for StoredEntry {
    fn from(record: &UpdateRecord) -> Self {
        Self {
            kind: EntryKind::Update,
            key: record.key.clone(),
            seq: record.seq,
            blob: record.delta.clone(),
            origin: record.origin.clone(),
            client_seq: record.client_seq,
            timestamp: record.received_at,
        }
    }
}

impl From<&Snapshot> for StoredEntry {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            kind: EntryKind::Snapshot,
            key: snapshot.key.clone(),
            seq: snapshot.seq,
            blob: snapshot.state.clone(),
            origin: String::new(),
            client_seq: 0,
            timestamp: snapshot.updated_at,
        }
    }
}

impl From<StoredEntry> for UpdateRecord {
    fn from(entry: StoredEntry) -> Self {
        Self {
            key: entry.key,
            seq: entry.seq,
            client_seq: entry.client_seq,
            delta: entry.blob,
            received_at: entry.timestamp,
            origin: entry.origin,
        }
    }
}

impl From<StoredEntry> for Snapshot {
    fn from(entry: StoredEntry) -> Self {
        Self {
            key: entry.key,
            seq: entry.seq,
            state: entry.blob,
            updated_at: entry.timestamp,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Generic document-store interface: get/put/query over tagged entries.
///
/// Calls are blocking; [`PersistenceLog`] moves them off the async runtime.
pub trait EntryStore: Send + Sync {
    /// Insert or overwrite the entry at (kind, key, seq).
    fn put(&self, entry: &StoredEntry) -> Result<(), StoreError>;

    fn get(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        seq: u64,
    ) -> Result<Option<StoredEntry>, StoreError>;

    /// Entry with the highest seq for (kind, key).
    fn latest(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<StoredEntry>, StoreError>;

    /// Entries of `kind` with `seq > after_seq`, ordered by (key, seq).
    ///
    /// `key = None` scans every document.
    fn query(
        &self,
        kind: EntryKind,
        key: Option<&DocumentKey>,
        after_seq: u64,
    ) -> Result<Vec<StoredEntry>, StoreError>;

    /// Delete entries of (kind, key) with `seq <= through_seq`. Returns the count.
    fn delete_through(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        through_seq: u64,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_entry_conversion() {
        let rec = UpdateRecord::new(DocumentKey::new("w", "b"), 9, vec![1, 2], "origin-1")
            .with_client_seq(4);
        let entry = StoredEntry::from(&rec);
        assert_eq!(entry.kind, EntryKind::Update);
        assert_eq!(entry.seq, 9);

        let back: UpdateRecord = entry.into();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_snapshot_entry_conversion() {
        let snap = Snapshot {
            key: DocumentKey::new("w", "b"),
            seq: 100,
            state: vec![1, 0],
            updated_at: 42,
        };
        let entry = StoredEntry::from(&snap);
        assert_eq!(entry.kind, EntryKind::Snapshot);
        assert!(entry.origin.is_empty());

        let back: Snapshot = entry.into();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EntryKind::Snapshot.to_string(), "snapshot");
        assert_eq!(EntryKind::Update.to_string(), "update");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
