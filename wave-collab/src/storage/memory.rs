//! In-process entry store for tests and store-less deployments.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{EntryKind, EntryStore, StoreError, StoredEntry};
use crate::types::DocumentKey;

type EntryMap = BTreeMap<(EntryKind, DocumentKey, u64), StoredEntry>;

/// BTreeMap-backed [`EntryStore`]. Ordering matches the RocksDB key layout.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<EntryMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries of `kind`.
    pub fn count(&self, kind: EntryKind) -> usize {
        self.read()
            .map(|entries| entries.keys().filter(|(k, _, _)| *k == kind).count())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, EntryMap>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, EntryMap>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl EntryStore for MemoryStore {
    fn put(&self, entry: &StoredEntry) -> Result<(), StoreError> {
        let mut entries = self.write()?;
        entries.insert((entry.kind, entry.key.clone(), entry.seq), entry.clone());
        Ok(())
    }

    fn get(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        seq: u64,
    ) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.read()?;
        Ok(entries.get(&(kind, key.clone(), seq)).cloned())
    }

    fn latest(&self, kind: EntryKind, key: &DocumentKey) -> Result<Option<StoredEntry>, StoreError> {
        let entries = self.read()?;
        let range = (kind, key.clone(), 0)..=(kind, key.clone(), u64::MAX);
        Ok(entries.range(range).next_back().map(|(_, e)| e.clone()))
    }

    fn query(
        &self,
        kind: EntryKind,
        key: Option<&DocumentKey>,
        after_seq: u64,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let entries = self.read()?;
        let Some(first) = after_seq.checked_add(1) else {
            return Ok(Vec::new());
        };

        let found = match key {
            Some(key) => entries
                .range((kind, key.clone(), first)..=(kind, key.clone(), u64::MAX))
                .map(|(_, e)| e.clone())
                .collect(),
            None => entries
                .iter()
                .filter(|((k, _, seq), _)| *k == kind && *seq >= first)
                .map(|(_, e)| e.clone())
                .collect(),
        };
        Ok(found)
    }

    fn delete_through(
        &self,
        kind: EntryKind,
        key: &DocumentKey,
        through_seq: u64,
    ) -> Result<u64, StoreError> {
        let mut entries = self.write()?;
        let doomed: Vec<_> = entries
            .range((kind, key.clone(), 0)..=(kind, key.clone(), through_seq))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            entries.remove(k);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EntryKind, key: &DocumentKey, seq: u64) -> StoredEntry {
        StoredEntry {
            kind,
            key: key.clone(),
            seq,
            blob: vec![seq as u8],
            origin: "o".into(),
            client_seq: 0,
            timestamp: seq,
        }
    }

    #[test]
    fn test_query_after_seq() {
        let store = MemoryStore::new();
        let key = DocumentKey::new("w", "b");
        for seq in 1..=10 {
            store.put(&entry(EntryKind::Update, &key, seq)).unwrap();
        }

        let since = store.query(EntryKind::Update, Some(&key), 7).unwrap();
        let seqs: Vec<u64> = since.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);

        assert!(store.query(EntryKind::Update, Some(&key), u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_latest_and_isolation() {
        let store = MemoryStore::new();
        let a = DocumentKey::new("w", "a");
        let b = DocumentKey::new("w", "b");
        store.put(&entry(EntryKind::Snapshot, &a, 5)).unwrap();
        store.put(&entry(EntryKind::Snapshot, &a, 50)).unwrap();
        store.put(&entry(EntryKind::Snapshot, &b, 7)).unwrap();

        assert_eq!(store.latest(EntryKind::Snapshot, &a).unwrap().unwrap().seq, 50);
        assert_eq!(store.latest(EntryKind::Snapshot, &b).unwrap().unwrap().seq, 7);
        assert!(store.latest(EntryKind::Update, &a).unwrap().is_none());
    }

    #[test]
    fn test_query_by_kind_only() {
        let store = MemoryStore::new();
        let a = DocumentKey::new("w", "a");
        let b = DocumentKey::new("w", "b");
        store.put(&entry(EntryKind::Snapshot, &a, 1)).unwrap();
        store.put(&entry(EntryKind::Snapshot, &b, 2)).unwrap();
        store.put(&entry(EntryKind::Update, &b, 3)).unwrap();

        let snaps = store.query(EntryKind::Snapshot, None, 0).unwrap();
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|e| e.kind == EntryKind::Snapshot));
    }

    #[test]
    fn test_delete_through() {
        let store = MemoryStore::new();
        let key = DocumentKey::new("w", "b");
        for seq in 1..=20 {
            store.put(&entry(EntryKind::Update, &key, seq)).unwrap();
        }

        assert_eq!(store.delete_through(EntryKind::Update, &key, 10).unwrap(), 10);
        let remaining = store.query(EntryKind::Update, Some(&key), 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].seq, 11);
        assert_eq!(store.count(EntryKind::Update), 10);
    }
}
