//! Active in-memory documents, their load/evict lifecycle and per-key locking.
//!
//! ```text
//!            open/lock                 drain_idle
//! Unloaded ──────────► Loading ──► Active ──────► (evicted) ──► Unloaded
//!     ▲                   │          │  ▲
//!     └── load failure ───┘   idle   ▼  │ access
//!                                   Idle
//! ```
//!
//! All mutation for a key goes through its [`DocumentHandle`] mutex; different
//! keys never contend except on the short-lived handle map lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock};

use crate::merge::DocState;
use crate::storage::{LoadError, PersistenceLog};
use crate::types::{now_millis, DocumentKey};

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unloaded,
    Loading,
    Active,
    /// Loaded but untouched for longer than the idle timeout
    Idle,
}

const PHASE_UNLOADED: u8 = 0;
const PHASE_LOADING: u8 = 1;
const PHASE_ACTIVE: u8 = 2;

/// Client seqs remembered per origin for duplicate detection.
pub const RECENT_PER_ORIGIN: usize = 256;

/// Recently accepted submissions: origin → client seq → assigned seq.
///
/// Only exact (origin, client seq) matches count as resubmissions, so
/// submissions arriving out of order are never mistaken for stale ones.
/// Each origin keeps its [`RECENT_PER_ORIGIN`] highest client seqs.
#[derive(Debug, Default)]
pub struct RecentSubmissions {
    by_origin: HashMap<String, BTreeMap<u64, u64>>,
}

impl RecentSubmissions {
    /// Seq assigned to an earlier submission of (origin, client_seq).
    pub fn assigned_seq(&self, origin: &str, client_seq: u64) -> Option<u64> {
        self.by_origin.get(origin)?.get(&client_seq).copied()
    }

    pub fn record(&mut self, origin: &str, client_seq: u64, seq: u64) {
        if client_seq == 0 {
            return;
        }
        let seen = self.by_origin.entry(origin.to_string()).or_default();
        seen.insert(client_seq, seq);
        while seen.len() > RECENT_PER_ORIGIN {
            seen.pop_first();
        }
    }

    pub fn clear(&mut self) {
        self.by_origin.clear();
    }
}

/// A loaded document plus its compaction bookkeeping.
pub struct LiveDocument {
    pub state: DocState,
    /// Seq of the latest persisted snapshot, 0 if none
    pub snapshot_seq: u64,
    /// Update records applied since that snapshot
    pub pending_since_snapshot: u64,
    /// Rebuilt from the replayed records on load
    pub recent: RecentSubmissions,
}

impl LiveDocument {
    pub fn needs_compaction(&self, threshold: u64) -> bool {
        self.pending_since_snapshot >= threshold.max(1)
    }

    /// Record that a snapshot at `seq` was persisted.
    pub fn mark_compacted(&mut self, seq: u64) {
        self.snapshot_seq = seq;
        self.pending_since_snapshot = 0;
    }
}

/// Serialization point for one document.
pub struct DocumentHandle {
    key: DocumentKey,
    slot: Arc<Mutex<Option<LiveDocument>>>,
    phase: AtomicU8,
    last_access: AtomicU64,
    /// Set once the handle left the registry map
    retired: AtomicU8,
}

impl DocumentHandle {
    fn new(key: DocumentKey) -> Self {
        Self {
            key,
            slot: Arc::new(Mutex::new(None)),
            phase: AtomicU8::new(PHASE_UNLOADED),
            last_access: AtomicU64::new(now_millis()),
            retired: AtomicU8::new(0),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: u8) {
        self.phase.store(phase, Ordering::Release);
    }

    fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_access.load(Ordering::Relaxed))
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire) != 0
    }

    fn lifecycle(&self, idle_timeout: Duration) -> Lifecycle {
        match self.phase() {
            PHASE_LOADING => Lifecycle::Loading,
            PHASE_ACTIVE if self.idle_for(now_millis()) > idle_timeout.as_millis() as u64 => {
                Lifecycle::Idle
            }
            PHASE_ACTIVE => Lifecycle::Active,
            _ => Lifecycle::Unloaded,
        }
    }
}

/// Exclusive access to a loaded document.
pub struct DocumentGuard {
    handle: Arc<DocumentHandle>,
    live: OwnedMappedMutexGuard<Option<LiveDocument>, LiveDocument>,
}

impl DocumentGuard {
    pub fn key(&self) -> &DocumentKey {
        &self.handle.key
    }

    /// Discard the in-memory state; the next access reloads from durable history.
    pub fn invalidate(mut self) {
        self.live.state = DocState::new();
        self.live.pending_since_snapshot = 0;
        self.live.recent.clear();
        self.handle.set_phase(PHASE_UNLOADED);
        log::warn!("Discarded in-memory state of {}", self.handle.key);
    }
}

impl Deref for DocumentGuard {
    type Target = LiveDocument;

    fn deref(&self) -> &LiveDocument {
        &self.live
    }
}

impl DerefMut for DocumentGuard {
    fn deref_mut(&mut self) -> &mut LiveDocument {
        &mut self.live
    }
}

/// Owner of every active document.
pub struct DocumentRegistry {
    handles: RwLock<HashMap<DocumentKey, Arc<DocumentHandle>>>,
    log: Arc<PersistenceLog>,
    idle_timeout: Duration,
}

impl DocumentRegistry {
    pub fn new(log: Arc<PersistenceLog>, idle_timeout: Duration) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            log,
            idle_timeout,
        }
    }

    /// Load the document if absent and return its handle.
    pub async fn open(&self, key: &DocumentKey) -> Result<Arc<DocumentHandle>, LoadError> {
        let guard = self.lock(key).await?;
        Ok(Arc::clone(&guard.handle))
    }

    /// Lock the document for mutation, loading it first when needed.
    ///
    /// A failed load leaves the document unloaded; empty state is never
    /// substituted for unreadable history.
    pub async fn lock(&self, key: &DocumentKey) -> Result<DocumentGuard, LoadError> {
        loop {
            let handle = self.handle(key).await;
            let mut slot = Arc::clone(&handle.slot).lock_owned().await;

            // Evicted while we waited for the lock
            if handle.is_retired() {
                continue;
            }

            if slot.is_none() || handle.phase() == PHASE_UNLOADED {
                handle.set_phase(PHASE_LOADING);
                match self.load(key).await {
                    Ok(live) => *slot = Some(live),
                    Err(e) => {
                        *slot = None;
                        handle.set_phase(PHASE_UNLOADED);
                        log::error!("Failed to load {key}: {e}");
                        return Err(e);
                    }
                }
                handle.set_phase(PHASE_ACTIVE);
            }

            handle.touch();
            return match OwnedMutexGuard::try_map(slot, |s| s.as_mut()) {
                Ok(live) => Ok(DocumentGuard { handle, live }),
                // Filled above
                Err(_) => continue,
            };
        }
    }

    /// Drop the in-memory entry. Persisted history is untouched.
    ///
    /// Waits for any in-flight mutation of the document to finish first.
    pub async fn remove(&self, key: &DocumentKey) -> bool {
        let Some(handle) = self.handles.read().await.get(key).cloned() else {
            return false;
        };
        let mut slot = Arc::clone(&handle.slot).lock_owned().await;

        let mut handles = self.handles.write().await;
        if !handles.get(key).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
            return false;
        }
        handles.remove(key);
        handle.retired.store(1, Ordering::Release);
        handle.set_phase(PHASE_UNLOADED);
        *slot = None;
        log::debug!("Removed {key} from registry");
        true
    }

    pub async fn lifecycle(&self, key: &DocumentKey) -> Lifecycle {
        match self.handles.read().await.get(key) {
            Some(handle) => handle.lifecycle(self.idle_timeout),
            None => Lifecycle::Unloaded,
        }
    }

    pub async fn is_loaded(&self, key: &DocumentKey) -> bool {
        matches!(
            self.lifecycle(key).await,
            Lifecycle::Active | Lifecycle::Idle
        )
    }

    pub async fn active_count(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Evict documents idle past the timeout and not in `subscribed`.
    ///
    /// Documents currently locked are skipped. Returns the evicted documents
    /// so the caller can compact them.
    pub async fn drain_idle(
        &self,
        subscribed: &HashSet<DocumentKey>,
    ) -> Vec<(DocumentKey, LiveDocument)> {
        self.drain_where(|handle, now| {
            !subscribed.contains(&handle.key)
                && handle.idle_for(now) > self.idle_timeout.as_millis() as u64
        })
        .await
    }

    /// Evict every unlocked document, regardless of idleness.
    pub async fn drain_all(&self) -> Vec<(DocumentKey, LiveDocument)> {
        self.drain_where(|_, _| true).await
    }

    async fn drain_where<P>(&self, evictable: P) -> Vec<(DocumentKey, LiveDocument)>
    where
        P: Fn(&DocumentHandle, u64) -> bool,
    {
        let now = now_millis();
        let mut handles = self.handles.write().await;
        let mut evicted = Vec::new();

        handles.retain(|key, handle| {
            if !evictable(handle, now) {
                return true;
            }
            let Ok(mut slot) = Arc::clone(&handle.slot).try_lock_owned() else {
                return true;
            };
            handle.retired.store(1, Ordering::Release);
            let loaded = handle.phase() == PHASE_ACTIVE;
            handle.set_phase(PHASE_UNLOADED);
            if let Some(live) = slot.take().filter(|_| loaded) {
                evicted.push((key.clone(), live));
            }
            false
        });

        if !evicted.is_empty() {
            log::info!("Evicted {} idle document(s)", evicted.len());
        }
        evicted
    }

    async fn handle(&self, key: &DocumentKey) -> Arc<DocumentHandle> {
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(key) {
                return Arc::clone(handle);
            }
        }

        let mut handles = self.handles.write().await;
        Arc::clone(
            handles
                .entry(key.clone())
                .or_insert_with(|| Arc::new(DocumentHandle::new(key.clone()))),
        )
    }

    async fn load(&self, key: &DocumentKey) -> Result<LiveDocument, LoadError> {
        let (snapshot, updates) = self.log.load_latest(key).await?;

        let (mut state, snapshot_seq) = match &snapshot {
            Some(snap) => {
                let state = DocState::from_snapshot(snap).map_err(|source| LoadError::Corrupt {
                    key: key.clone(),
                    seq: snap.seq,
                    source,
                })?;
                (state, snap.seq)
            }
            None => (DocState::new(), 0),
        };

        let mut pending = 0;
        let mut recent = RecentSubmissions::default();
        for record in &updates {
            let outcome = state
                .apply_update(record)
                .map_err(|source| LoadError::Corrupt {
                    key: key.clone(),
                    seq: record.seq,
                    source,
                })?;
            if outcome.applied {
                pending += 1;
            }
            recent.record(&record.origin, record.client_seq, record.seq);
        }

        log::info!(
            "Loaded {key} at seq {} (snapshot {snapshot_seq}, replayed {pending})",
            state.last_applied_seq()
        );
        Ok(LiveDocument {
            state,
            snapshot_seq,
            pending_since_snapshot: pending,
            recent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Replica;
    use crate::types::{Snapshot, UpdateRecord};

    fn key() -> DocumentKey {
        DocumentKey::new("wave", "blip")
    }

    fn registry(log: Arc<PersistenceLog>, idle: Duration) -> DocumentRegistry {
        DocumentRegistry::new(log, idle)
    }

    #[tokio::test]
    async fn test_open_starts_empty() {
        let reg = registry(Arc::new(PersistenceLog::in_memory()), Duration::from_secs(60));
        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Unloaded);

        let guard = reg.lock(&key()).await.unwrap();
        assert_eq!(guard.state.last_applied_seq(), 0);
        assert_eq!(guard.snapshot_seq, 0);
        drop(guard);

        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Active);
    }

    #[tokio::test]
    async fn test_load_replays_after_snapshot() {
        let log = Arc::new(PersistenceLog::in_memory());
        let replica = Replica::new(1);
        let mut folded = DocState::new();
        for seq in 1..=5u64 {
            let delta = replica.append("content", "x");
            let rec = UpdateRecord::new(key(), seq, delta, "r1");
            folded.apply_update(&rec).unwrap();
            log.append_update(&rec).await.unwrap();
            if seq == 3 {
                log.write_snapshot(&folded.to_snapshot(&key())).await.unwrap();
            }
        }

        let reg = registry(log, Duration::from_secs(60));
        let guard = reg.lock(&key()).await.unwrap();
        assert_eq!(guard.state.last_applied_seq(), 5);
        assert_eq!(guard.snapshot_seq, 3);
        assert_eq!(guard.pending_since_snapshot, 2);
        assert_eq!(guard.state.text("content"), "xxxxx");
    }

    #[tokio::test]
    async fn test_load_rebuilds_recent_submissions() {
        let log = Arc::new(PersistenceLog::in_memory());
        let replica = Replica::new(1);
        for seq in 1..=3u64 {
            let rec = UpdateRecord::new(key(), seq, replica.append("content", "x"), "r1")
                .with_client_seq(seq + 10);
            log.append_update(&rec).await.unwrap();
        }

        let reg = registry(log, Duration::from_secs(60));
        let guard = reg.lock(&key()).await.unwrap();
        assert_eq!(guard.recent.assigned_seq("r1", 12), Some(2));
        assert_eq!(guard.recent.assigned_seq("r2", 12), None);
        assert_eq!(guard.recent.assigned_seq("r1", 2), None);
    }

    #[test]
    fn test_recent_submissions_keep_highest_per_origin() {
        let mut recent = RecentSubmissions::default();
        for client_seq in 1..=(RECENT_PER_ORIGIN as u64 + 5) {
            recent.record("a", client_seq, client_seq * 2);
        }
        recent.record("b", 1, 99);
        recent.record("c", 0, 100);

        assert_eq!(recent.assigned_seq("a", 1), None);
        assert_eq!(recent.assigned_seq("a", 6), Some(12));
        assert_eq!(recent.assigned_seq("b", 1), Some(99));
        assert_eq!(recent.assigned_seq("c", 0), None);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_closed() {
        let log = Arc::new(PersistenceLog::in_memory());
        log.write_snapshot(&Snapshot {
            key: key(),
            seq: 4,
            state: vec![9, 9, 9],
            updated_at: 1,
        })
        .await
        .unwrap();

        let reg = registry(log, Duration::from_secs(60));
        let err = reg.lock(&key()).await.err().unwrap();
        assert!(matches!(err, LoadError::Corrupt { seq: 4, .. }));
        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Unloaded);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let log = Arc::new(PersistenceLog::in_memory());
        let reg = registry(Arc::clone(&log), Duration::from_secs(60));

        let mut guard = reg.lock(&key()).await.unwrap();
        let delta = Replica::new(1).append("content", "lost");
        guard
            .state
            .apply_update(&UpdateRecord::new(key(), 1, delta, "r1"))
            .unwrap();
        guard.invalidate();

        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Unloaded);
        let guard = reg.lock(&key()).await.unwrap();
        assert_eq!(guard.state.last_applied_seq(), 0);
        assert_eq!(guard.state.text("content"), "");
    }

    #[tokio::test]
    async fn test_drain_idle_skips_subscribed_and_fresh() {
        let reg = registry(Arc::new(PersistenceLog::in_memory()), Duration::ZERO);
        let a = DocumentKey::new("w", "a");
        let b = DocumentKey::new("w", "b");
        reg.open(&a).await.unwrap();
        reg.open(&b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let subscribed: HashSet<_> = [b.clone()].into_iter().collect();
        let evicted = reg.drain_idle(&subscribed).await;

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, a);
        assert_eq!(reg.lifecycle(&a).await, Lifecycle::Unloaded);
        assert!(reg.is_loaded(&b).await);
    }

    #[tokio::test]
    async fn test_drain_skips_locked_documents() {
        let reg = registry(Arc::new(PersistenceLog::in_memory()), Duration::ZERO);
        let guard = reg.lock(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(reg.drain_idle(&HashSet::new()).await.is_empty());
        drop(guard);
        assert_eq!(reg.drain_idle(&HashSet::new()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_lifecycle() {
        let reg = registry(Arc::new(PersistenceLog::in_memory()), Duration::from_millis(50));
        reg.open(&key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Idle);

        // Access without reload returns it to Active
        drop(reg.lock(&key()).await.unwrap());
        assert_eq!(reg.lifecycle(&key()).await, Lifecycle::Active);
    }

    #[tokio::test]
    async fn test_remove_keeps_history() {
        let log = Arc::new(PersistenceLog::in_memory());
        let delta = Replica::new(1).append("content", "kept");
        log.append_update(&UpdateRecord::new(key(), 1, delta, "r1"))
            .await
            .unwrap();

        let reg = registry(log, Duration::from_secs(60));
        reg.open(&key()).await.unwrap();
        assert!(reg.remove(&key()).await);
        assert!(!reg.remove(&key()).await);
        assert_eq!(reg.active_count().await, 0);

        let guard = reg.lock(&key()).await.unwrap();
        assert_eq!(guard.state.text("content"), "kept");
    }

    #[tokio::test]
    async fn test_different_keys_lock_independently() {
        let reg = registry(Arc::new(PersistenceLog::in_memory()), Duration::from_secs(60));
        let _a = reg.lock(&DocumentKey::new("w", "a")).await.unwrap();
        let b = tokio::time::timeout(
            Duration::from_millis(500),
            reg.lock(&DocumentKey::new("w", "b")),
        )
        .await;
        assert!(b.is_ok());
    }
}
