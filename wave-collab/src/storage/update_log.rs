//! Append-only update log with snapshot compaction over an [`EntryStore`].
//!
//! Every store call runs on the blocking pool so a slow store never stalls
//! the async workers serving other documents. Writes and reads are retried
//! with bounded exponential backoff; exhausting the retries surfaces
//! [`PersistenceError`] (writes) or [`LoadError`] (document loads).
//!
//! History scans read the latest snapshot and then the records above it in
//! separate store calls. Compaction writes its snapshot before truncating, so
//! a scan re-reads the snapshot seq at the end and retries if it moved.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use super::retry::{retry, RetryConfig};
use super::{EntryKind, EntryStore, MemoryStore, StoreError, StoredEntry};
use crate::merge::MergeError;
use crate::types::{DocumentKey, ResyncItem, Snapshot, UpdateRecord};

/// A store operation failed after all retries.
#[derive(Debug, Clone, Error)]
#[error("persistence failed for {key} after {attempts} attempt(s): {source}")]
pub struct PersistenceError {
    pub key: DocumentKey,
    pub attempts: u32,
    pub source: StoreError,
}

/// A document could not be rebuilt from durable history.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("failed to read history for {key}: {source}")]
    Store { key: DocumentKey, source: StoreError },
    #[error("history for {key} is corrupt at seq {seq}: {source}")]
    Corrupt {
        key: DocumentKey,
        seq: u64,
        source: MergeError,
    },
}

/// Durable update log and snapshot storage.
pub struct PersistenceLog {
    store: Arc<dyn EntryStore>,
    retry: RetryConfig,
}

impl PersistenceLog {
    pub fn new(store: Arc<dyn EntryStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Log backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RetryConfig::for_testing())
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Durably append one update record. Returns only after the store accepted it.
    pub async fn append_update(&self, record: &UpdateRecord) -> Result<(), PersistenceError> {
        let entry = StoredEntry::from(record);
        self.with_retry("append_update", &record.key, move |store| store.put(&entry))
            .await
    }

    /// Persist a snapshot.
    pub async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let entry = StoredEntry::from(snapshot);
        self.with_retry("write_snapshot", &snapshot.key, move |store| store.put(&entry))
            .await
    }

    /// Drop update records at or below `through_seq`.
    pub async fn truncate_through(
        &self,
        key: &DocumentKey,
        through_seq: u64,
    ) -> Result<u64, PersistenceError> {
        let owned = key.clone();
        self.with_retry("truncate_log", key, move |store| {
            store.delete_through(EntryKind::Update, &owned, through_seq)
        })
        .await
    }

    /// Latest snapshot plus every update record above its seq, in seq order.
    pub async fn load_latest(
        &self,
        key: &DocumentKey,
    ) -> Result<(Option<Snapshot>, Vec<UpdateRecord>), LoadError> {
        let owned = key.clone();
        let (snapshot, updates) = self
            .with_retry("load_latest", key, move |store| {
                let snapshot = store.latest(EntryKind::Snapshot, &owned)?;
                let after = snapshot.as_ref().map_or(0, |s| s.seq);
                let updates = store.query(EntryKind::Update, Some(&owned), after)?;
                ensure_snapshot_unchanged(store, &owned, snapshot.as_ref().map(|s| s.seq))?;
                Ok((snapshot, updates))
            })
            .await
            .map_err(|e| LoadError::Store {
                key: e.key,
                source: e.source,
            })?;

        Ok((
            snapshot.map(Snapshot::from),
            updates.into_iter().map(UpdateRecord::from).collect(),
        ))
    }

    /// Everything a replica needs to catch up from `from_seq`.
    ///
    /// Returns the update records with `seq > from_seq` in increasing order.
    /// When those records were truncated by compaction, the covering snapshot
    /// comes first as a single item carrying its own seq and state blob.
    pub async fn updates_since(
        &self,
        key: &DocumentKey,
        from_seq: u64,
    ) -> Result<Vec<ResyncItem>, PersistenceError> {
        let owned = key.clone();
        self.with_retry("resync", key, move |store| {
            let mut items = Vec::new();
            let mut after = from_seq;

            let latest = store.latest(EntryKind::Snapshot, &owned)?;
            let scanned_at = latest.as_ref().map(|s| s.seq);
            if let Some(snapshot) = latest {
                let truncated = snapshot.seq > from_seq
                    && store.get(EntryKind::Update, &owned, snapshot.seq)?.is_none();
                if truncated {
                    after = snapshot.seq;
                    items.push(ResyncItem {
                        seq: snapshot.seq,
                        delta: snapshot.blob,
                    });
                }
            }

            for entry in store.query(EntryKind::Update, Some(&owned), after)? {
                items.push(ResyncItem {
                    seq: entry.seq,
                    delta: entry.blob,
                });
            }
            ensure_snapshot_unchanged(store, &owned, scanned_at)?;
            Ok(items)
        })
        .await
    }

    /// Latest snapshot of every document, for search rebuilds.
    /// Every document of `wave_id` with persisted history, in key order.
    pub async fn wave_documents(&self, wave_id: &str) -> Result<Vec<DocumentKey>, StoreError> {
        let store = Arc::clone(&self.store);
        let wave = wave_id.to_string();
        let keys = run_blocking(store, move |store| {
            let mut keys = BTreeSet::new();
            for kind in [EntryKind::Snapshot, EntryKind::Update] {
                for entry in store.query(kind, None, 0)? {
                    if entry.key.wave_id == wave {
                        keys.insert(entry.key);
                    }
                }
            }
            Ok(keys)
        })
        .await?;
        Ok(keys.into_iter().collect())
    }

    pub async fn latest_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        let store = Arc::clone(&self.store);
        let entries = run_blocking(store, |store| store.query(EntryKind::Snapshot, None, 0)).await?;

        let mut latest: BTreeMap<DocumentKey, StoredEntry> = BTreeMap::new();
        for entry in entries {
            match latest.get(&entry.key) {
                Some(existing) if existing.seq >= entry.seq => {}
                _ => {
                    latest.insert(entry.key.clone(), entry);
                }
            }
        }
        Ok(latest.into_values().map(Snapshot::from).collect())
    }

    async fn with_retry<T, F>(
        &self,
        operation: &str,
        key: &DocumentKey,
        op: F,
    ) -> Result<T, PersistenceError>
    where
        F: Fn(&dyn EntryStore) -> Result<T, StoreError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        retry(operation, &self.retry, || {
            run_blocking(Arc::clone(&self.store), op.clone())
        })
        .await
        .map_err(|source| {
            log::error!("{operation} for {key} gave up: {source}");
            PersistenceError {
                key: key.clone(),
                attempts: self.retry.max_attempts.max(1),
                source,
            }
        })
    }
}

/// Fail the scan if a snapshot was written since `scanned_at` was read.
///
/// A newer snapshot may have been followed by truncation, so records the
/// scan expected can be gone. The error is transient and the scan retried.
fn ensure_snapshot_unchanged(
    store: &dyn EntryStore,
    key: &DocumentKey,
    scanned_at: Option<u64>,
) -> Result<(), StoreError> {
    let now = store.latest(EntryKind::Snapshot, key)?.map(|s| s.seq);
    if now != scanned_at {
        return Err(StoreError::Unavailable(format!(
            "snapshot of {key} moved from {scanned_at:?} to {now:?} during scan"
        )));
    }
    Ok(())
}

async fn run_blocking<T, F>(store: Arc<dyn EntryStore>, op: F) -> Result<T, StoreError>
where
    F: FnOnce(&dyn EntryStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Io(format!("store task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl EntryStore for FlakyStore {
        fn put(&self, entry: &StoredEntry) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.put(entry)
        }
        fn get(&self, kind: EntryKind, key: &DocumentKey, seq: u64) -> Result<Option<StoredEntry>, StoreError> {
            self.inner.get(kind, key, seq)
        }
        fn latest(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<StoredEntry>, StoreError> {
            self.inner.latest(kind, key)
        }
        fn query(&self, kind: EntryKind, key: Option<&DocumentKey>, after: u64) -> Result<Vec<StoredEntry>, StoreError> {
            self.inner.query(kind, key, after)
        }
        fn delete_through(&self, kind: EntryKind, key: &DocumentKey, seq: u64) -> Result<u64, StoreError> {
            self.inner.delete_through(kind, key, seq)
        }
    }

    /// Runs a truncating compaction right before the first update scan.
    struct CompactingStore {
        inner: MemoryStore,
        compact_at: u64,
        armed: AtomicU32,
    }

    impl EntryStore for CompactingStore {
        fn put(&self, entry: &StoredEntry) -> Result<(), StoreError> {
            self.inner.put(entry)
        }
        fn get(&self, kind: EntryKind, key: &DocumentKey, seq: u64) -> Result<Option<StoredEntry>, StoreError> {
            self.inner.get(kind, key, seq)
        }
        fn latest(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<StoredEntry>, StoreError> {
            self.inner.latest(kind, key)
        }
        fn query(&self, kind: EntryKind, key: Option<&DocumentKey>, after: u64) -> Result<Vec<StoredEntry>, StoreError> {
            if let (EntryKind::Update, Some(k)) = (kind, key) {
                if self.armed.swap(0, Ordering::SeqCst) == 1 {
                    self.inner.put(&StoredEntry::from(&snapshot(self.compact_at)))?;
                    self.inner.delete_through(EntryKind::Update, k, self.compact_at)?;
                }
            }
            self.inner.query(kind, key, after)
        }
        fn delete_through(&self, kind: EntryKind, key: &DocumentKey, seq: u64) -> Result<u64, StoreError> {
            self.inner.delete_through(kind, key, seq)
        }
    }

    async fn compacting_log(records: u64, compact_at: u64) -> (Arc<CompactingStore>, PersistenceLog) {
        let store = Arc::new(CompactingStore {
            inner: MemoryStore::new(),
            compact_at,
            armed: AtomicU32::new(0),
        });
        let log = PersistenceLog::new(store.clone(), RetryConfig::for_testing());
        for seq in 1..=records {
            log.append_update(&UpdateRecord::new(key(), seq, vec![1, seq as u8], "x"))
                .await
                .unwrap();
        }
        store.armed.store(1, Ordering::SeqCst);
        (store, log)
    }

    fn key() -> DocumentKey {
        DocumentKey::new("wave", "blip")
    }

    fn snapshot(seq: u64) -> Snapshot {
        Snapshot {
            key: key(),
            seq,
            state: vec![1, seq as u8],
            updated_at: seq,
        }
    }

    #[tokio::test]
    async fn test_load_latest_replays_after_snapshot() {
        let log = PersistenceLog::in_memory();
        for seq in 1..=6 {
            log.append_update(&UpdateRecord::new(key(), seq, vec![1, seq as u8], "x"))
                .await
                .unwrap();
        }
        log.write_snapshot(&snapshot(4)).await.unwrap();

        let (snap, updates) = log.load_latest(&key()).await.unwrap();
        assert_eq!(snap.unwrap().seq, 4);
        let seqs: Vec<u64> = updates.iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_load_latest_empty_document() {
        let log = PersistenceLog::in_memory();
        let (snap, updates) = log.load_latest(&key()).await.unwrap();
        assert!(snap.is_none());
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_append_retries_transient_failures() {
        let store = Arc::new(FlakyStore::new(2));
        let log = PersistenceLog::new(store.clone(), RetryConfig::for_testing());

        log.append_update(&UpdateRecord::new(key(), 1, vec![1], "x"))
            .await
            .unwrap();
        assert_eq!(store.inner.count(EntryKind::Update), 1);
    }

    #[tokio::test]
    async fn test_append_surfaces_exhausted_retries() {
        let store = Arc::new(FlakyStore::new(10));
        let log = PersistenceLog::new(store.clone(), RetryConfig::for_testing());

        let err = log
            .append_update(&UpdateRecord::new(key(), 1, vec![1], "x"))
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.key, key());
        assert_eq!(store.inner.count(EntryKind::Update), 0);
    }

    #[tokio::test]
    async fn test_updates_since_exact_range() {
        let log = PersistenceLog::in_memory();
        for seq in [1u64, 2, 4, 7, 9] {
            log.append_update(&UpdateRecord::new(key(), seq, vec![1, seq as u8], "x"))
                .await
                .unwrap();
        }
        log.write_snapshot(&snapshot(4)).await.unwrap();

        let items = log.updates_since(&key(), 2).await.unwrap();
        let seqs: Vec<u64> = items.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![4, 7, 9]);
    }

    #[tokio::test]
    async fn test_updates_since_after_truncation_starts_with_snapshot() {
        let log = PersistenceLog::in_memory();
        for seq in 1..=10 {
            log.append_update(&UpdateRecord::new(key(), seq, vec![1, seq as u8], "x"))
                .await
                .unwrap();
        }
        log.write_snapshot(&snapshot(8)).await.unwrap();
        assert_eq!(log.truncate_through(&key(), 8).await.unwrap(), 8);

        let items = log.updates_since(&key(), 3).await.unwrap();
        let seqs: Vec<u64> = items.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
        assert_eq!(items[0].delta, snapshot(8).state);

        // Caller already past the snapshot: plain records only
        let items = log.updates_since(&key(), 9).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seq, 10);
    }

    #[tokio::test]
    async fn test_updates_since_survives_concurrent_truncation() {
        let (store, log) = compacting_log(10, 8).await;

        let items = log.updates_since(&key(), 2).await.unwrap();
        let seqs: Vec<u64> = items.iter().map(|i| i.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
        assert_eq!(items[0].delta, snapshot(8).state);
        assert_eq!(store.inner.count(EntryKind::Update), 2);
    }

    #[tokio::test]
    async fn test_load_latest_survives_concurrent_truncation() {
        let (_store, log) = compacting_log(10, 6).await;

        let (snap, updates) = log.load_latest(&key()).await.unwrap();
        assert_eq!(snap.unwrap().seq, 6);
        let seqs: Vec<u64> = updates.iter().map(|u| u.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_wave_documents_lists_one_wave() {
        let log = PersistenceLog::in_memory();
        for (wave, blip) in [("w1", "b"), ("w1", "a"), ("w2", "a")] {
            log.append_update(&UpdateRecord::new(DocumentKey::new(wave, blip), 1, vec![1], "x"))
                .await
                .unwrap();
        }
        log.write_snapshot(&Snapshot {
            key: DocumentKey::new("w1", "c"),
            seq: 3,
            state: vec![1],
            updated_at: 1,
        })
        .await
        .unwrap();

        let keys = log.wave_documents("w1").await.unwrap();
        let blips: Vec<&str> = keys.iter().map(|k| k.blip_id.as_str()).collect();
        assert_eq!(blips, vec!["a", "b", "c"]);
        assert!(log.wave_documents("w3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_snapshots_one_per_document() {
        let log = PersistenceLog::in_memory();
        log.write_snapshot(&snapshot(3)).await.unwrap();
        log.write_snapshot(&snapshot(9)).await.unwrap();
        log.write_snapshot(&Snapshot {
            key: DocumentKey::new("wave", "other"),
            seq: 1,
            state: vec![1],
            updated_at: 1,
        })
        .await
        .unwrap();

        let snaps = log.latest_snapshots().await.unwrap();
        assert_eq!(snaps.len(), 2);
        let mine = snaps.iter().find(|s| s.key == key()).unwrap();
        assert_eq!(mine.seq, 9);
    }
}
