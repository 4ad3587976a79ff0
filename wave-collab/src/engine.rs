//! Ingestion pipeline and service lifecycle.
//!
//! Per document, in order, under the document's handle:
//! ```text
//! lock ──► dedupe ──► assign seq ──► merge ──► durable append ──► compact (if due) ──► publish ──► ack
//!            │                         │             │
//!            │ seen (origin, cseq)     │ MergeError  │ PersistenceError: in-memory state discarded
//!            ▼                         ▼             ▼
//!           200                       400           503
//! ```
//!
//! The document seq is assigned here, as `last_applied_seq + 1`, so
//! concurrent submitters never compete for a number. The submitter's own
//! seq only identifies resubmissions from the same origin.
//!
//! Publishing is a non-blocking channel send made while the handle is held,
//! so fan-out order equals apply order for every key.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastFanout, DeltaEvent, Subscription};
use crate::ingest::{
    IngestRequest, IngestResponse, RebuildRequest, RebuildResponse, RebuiltBlip, SearchRequest,
    SearchResponse, ValidatedUpdate, ValidationError,
};
use crate::merge::MergeError;
use crate::registry::{DocumentRegistry, Lifecycle, LiveDocument};
use crate::search::{SearchConfig, SearchIndexer, SearchQuery};
use crate::storage::{
    EntryStore, LoadError, MemoryStore, PersistenceError, PersistenceLog, RetryConfig,
    RocksStore, StoreConfig, StoreError,
};
use crate::types::{DocumentKey, ResyncItem, SearchEntry, Snapshot, UpdateRecord};

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Updates since the last snapshot that trigger compaction
    pub compaction_threshold: u64,
    /// Delete update records covered by a new snapshot
    pub truncate_on_compact: bool,
    pub idle_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Events buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    pub retry: RetryConfig,
    pub search: SearchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 100,
            truncate_on_compact: false,
            idle_timeout_ms: 5 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            broadcast_capacity: 256,
            retry: RetryConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Short timers and fast retries.
    pub fn for_testing() -> Self {
        Self {
            idle_timeout_ms: 50,
            sweep_interval_ms: 20,
            retry: RetryConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Successful ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Merged and durably logged at document seq `seq`
    Accepted { seq: u64, client_seq: u64 },
    /// Resubmission of an accepted (origin, client seq); nothing changed.
    /// `seq` is the one assigned the first time.
    Duplicate { seq: u64, client_seq: u64 },
}

impl IngestOutcome {
    pub fn status(&self) -> u16 {
        match self {
            Self::Accepted { .. } => 201,
            Self::Duplicate { .. } => 200,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Self::Accepted { seq, .. } | Self::Duplicate { seq, .. } => *seq,
        }
    }

    pub fn client_seq(&self) -> u64 {
        match self {
            Self::Accepted { client_seq, .. } | Self::Duplicate { client_seq, .. } => *client_seq,
        }
    }
}

/// Top-level engine errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("merge rejected for {key}: {source}")]
    Merge { key: DocumentKey, source: MergeError },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// HTTP status for the ingestion/search surface.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Merge { .. } => 400,
            Self::Persistence(_) | Self::Load(_) | Self::Store(_) | Self::ShuttingDown => 503,
        }
    }
}

/// The synchronization service: registry, persistence, fan-out and search.
pub struct SyncEngine {
    config: EngineConfig,
    log: Arc<PersistenceLog>,
    registry: DocumentRegistry,
    fanout: BroadcastFanout,
    search: SearchIndexer,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn EntryStore>) -> Self {
        let log = Arc::new(PersistenceLog::new(store, config.retry.clone()));
        Self {
            registry: DocumentRegistry::new(Arc::clone(&log), config.idle_timeout()),
            fanout: BroadcastFanout::new(config.broadcast_capacity, Arc::clone(&log)),
            search: SearchIndexer::new(config.search.clone()),
            log,
            config,
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Engine over a fresh [`MemoryStore`].
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Engine over a RocksDB store at `store_config.path`.
    pub fn open_rocks(config: EngineConfig, store_config: StoreConfig) -> Result<Self, StoreError> {
        let store = RocksStore::open(store_config)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<PersistenceLog> {
        &self.log
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn fanout(&self) -> &BroadcastFanout {
        &self.fanout
    }

    pub fn search_index(&self) -> &SearchIndexer {
        &self.search
    }

    /// Rebuild the search index and start the idle sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.shutting_down.store(false, Ordering::Release);
        self.search.rebuild(&self.log).await?;

        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.sweep_idle().await;
            }
        });

        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
        log::info!("Sync engine started (sweep every {:?})", period);
        Ok(())
    }

    /// Stop the sweeper, refuse new updates and compact every dirty document.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(task) = self.sweeper.lock().ok().and_then(|mut s| s.take()) {
            task.abort();
        }

        let drained = self.registry.drain_all().await;
        let compacted = self.compact_evicted(drained).await;
        log::info!("Sync engine stopped ({compacted} document(s) compacted)");
    }

    /// Merge, persist and fan out one validated update from `origin`.
    pub async fn ingest(
        &self,
        update: ValidatedUpdate,
        origin: &str,
    ) -> Result<IngestOutcome, SyncError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }
        let mut doc = self.registry.lock(&update.key).await?;
        let client_seq = update.client_seq;

        if let Some(seq) = doc.recent.assigned_seq(origin, client_seq) {
            log::debug!(
                "Duplicate submission {client_seq} from {origin} for {} (seq {seq})",
                update.key
            );
            return Ok(IngestOutcome::Duplicate { seq, client_seq });
        }

        let seq = doc.state.last_applied_seq() + 1;
        let record =
            UpdateRecord::new(update.key, seq, update.delta, origin).with_client_seq(client_seq);
        doc.state.apply_update(&record).map_err(|source| {
            log::warn!("Rejected update {client_seq} from {origin} for {}: {source}", record.key);
            SyncError::Merge {
                key: record.key.clone(),
                source,
            }
        })?;

        if let Err(e) = self.log.append_update(&record).await {
            doc.invalidate();
            return Err(e.into());
        }
        doc.recent.record(origin, client_seq, seq);
        doc.pending_since_snapshot += 1;

        if doc.needs_compaction(self.config.compaction_threshold) {
            let key = doc.key().clone();
            // The update is already durable; a failed snapshot is retried next time
            if let Err(e) = self.compact_document(&key, &mut doc).await {
                log::warn!("Compaction of {key} failed: {e}");
            }
        }

        self.fanout
            .publish(DeltaEvent {
                key: record.key,
                seq: record.seq,
                delta: record.delta,
                origin: record.origin,
            })
            .await;

        Ok(IngestOutcome::Accepted { seq, client_seq })
    }

    /// Decode a JSON ingestion body and ingest it; returns (status, body).
    pub async fn ingest_json(&self, body: &[u8], origin: &str) -> (u16, IngestResponse) {
        let result = match IngestRequest::from_json(body).and_then(IngestRequest::validate) {
            Ok(update) => self.ingest(update, origin).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(outcome @ IngestOutcome::Accepted { seq, client_seq }) => {
                (outcome.status(), IngestResponse::accepted(seq, client_seq))
            }
            Ok(outcome @ IngestOutcome::Duplicate { seq, client_seq }) => {
                (outcome.status(), IngestResponse::duplicate(seq, client_seq))
            }
            Err(e) => (e.status(), IngestResponse::failed(e.to_string())),
        }
    }

    /// Write a snapshot of `key` at its last applied seq.
    ///
    /// Returns `None` for a document without any applied update.
    pub async fn compact(&self, key: &DocumentKey) -> Result<Option<Snapshot>, SyncError> {
        let mut doc = self.registry.lock(key).await?;
        if doc.state.last_applied_seq() == 0 {
            return Ok(None);
        }
        let snapshot = self.compact_document(key, &mut doc).await?;
        Ok(Some(snapshot))
    }

    /// Fold every document of a wave, or one blip of it, into a fresh snapshot.
    ///
    /// Documents are loaded (snapshot plus replay) under their handles, so a
    /// rebuild serializes with concurrent ingestion.
    pub async fn rebuild_wave(
        &self,
        wave_id: &str,
        blip_id: Option<&str>,
    ) -> Result<Vec<RebuiltBlip>, SyncError> {
        if wave_id.trim().is_empty() {
            return Err(ValidationError::MissingField("waveId").into());
        }
        let keys = match blip_id {
            Some(blip) => vec![DocumentKey::new(wave_id, blip)],
            None => self.log.wave_documents(wave_id).await?,
        };

        let mut rebuilt = Vec::with_capacity(keys.len());
        for key in keys {
            let mut doc = self.registry.lock(&key).await?;
            if doc.state.last_applied_seq() == 0 {
                continue;
            }
            let applied = doc.pending_since_snapshot;
            let snapshot = self.compact_document(&key, &mut doc).await?;
            rebuilt.push(RebuiltBlip {
                blip_id: key.blip_id,
                seq: snapshot.seq,
                applied,
            });
        }
        log::info!("Rebuilt {} document(s) of wave {wave_id}", rebuilt.len());
        Ok(rebuilt)
    }

    /// Decode a rebuild body (optional `blipId`) and rebuild the wave.
    pub async fn rebuild_json(
        &self,
        wave_id: &str,
        body: &[u8],
    ) -> Result<RebuildResponse, SyncError> {
        let req = RebuildRequest::from_json(body)?;
        let blips = self.rebuild_wave(wave_id, req.blip_id.as_deref()).await?;
        Ok(RebuildResponse::new(wave_id, blips))
    }

    /// Load `key` if needed and report its lifecycle.
    pub async fn open(&self, key: &DocumentKey) -> Result<Lifecycle, SyncError> {
        self.registry.open(key).await?;
        Ok(self.registry.lifecycle(key).await)
    }

    /// Plain text of the configured root of `key`, loading it if needed.
    pub async fn text(&self, key: &DocumentKey) -> Result<String, SyncError> {
        let doc = self.registry.lock(key).await?;
        Ok(doc.state.text(&self.config.search.text_root))
    }

    /// Current full state of `key` as a versioned envelope, with its seq.
    pub async fn state(&self, key: &DocumentKey) -> Result<(u64, Vec<u8>), SyncError> {
        let doc = self.registry.lock(key).await?;
        Ok((doc.state.last_applied_seq(), doc.state.state_blob()))
    }

    pub async fn subscribe(
        &self,
        key: &DocumentKey,
        subscriber_id: &str,
        from_seq: u64,
    ) -> Subscription {
        self.fanout.subscribe(key, subscriber_id, from_seq).await
    }

    pub async fn unsubscribe(&self, key: &DocumentKey, subscriber_id: &str) -> bool {
        self.fanout.unsubscribe(key, subscriber_id).await
    }

    /// Catch-up items for `key` after `from_seq`, from the durable log only.
    pub async fn resync(&self, key: &DocumentKey, from_seq: u64) -> Result<Vec<ResyncItem>, SyncError> {
        Ok(self.fanout.resync(key, from_seq).await?)
    }

    pub async fn search(&self, query: &SearchQuery) -> Vec<SearchEntry> {
        self.search.query(query).await
    }

    pub async fn search_json(&self, body: &[u8]) -> Result<SearchResponse, SyncError> {
        let query = SearchQuery::from(SearchRequest::from_json(body)?);
        let hits = self.search.query(&query).await;
        Ok(SearchResponse::from(hits.as_slice()))
    }

    /// Re-index search from persisted snapshots.
    pub async fn rebuild_search(&self) -> Result<usize, SyncError> {
        Ok(self.search.rebuild(&self.log).await?)
    }

    /// Evict idle, unsubscribed documents, compacting dirty ones first.
    pub async fn sweep_idle(&self) -> usize {
        let subscribed = self.fanout.subscribed_keys().await;
        let evicted = self.registry.drain_idle(&subscribed).await;
        let count = evicted.len();
        self.compact_evicted(evicted).await;
        count
    }

    async fn compact_evicted(&self, docs: Vec<(DocumentKey, LiveDocument)>) -> usize {
        let mut compacted = 0;
        for (key, mut doc) in docs {
            if doc.pending_since_snapshot == 0 {
                continue;
            }
            match self.compact_document(&key, &mut doc).await {
                Ok(_) => compacted += 1,
                Err(e) => log::warn!("Compaction of evicted {key} failed: {e}"),
            }
        }
        compacted
    }

    async fn compact_document(
        &self,
        key: &DocumentKey,
        doc: &mut LiveDocument,
    ) -> Result<Snapshot, SyncError> {
        let snapshot = doc.state.to_snapshot(key);
        self.log.write_snapshot(&snapshot).await?;
        doc.mark_compacted(snapshot.seq);

        if self.config.truncate_on_compact {
            match self.log.truncate_through(key, snapshot.seq).await {
                Ok(removed) => log::debug!("Truncated {removed} update(s) of {key}"),
                Err(e) => log::warn!("Truncating {key} through {} failed: {e}", snapshot.seq),
            }
        }

        if let Err(e) = self.search.index_snapshot(&snapshot).await {
            log::warn!("Indexing snapshot of {key} failed: {e}");
        }
        log::info!("Compacted {key} at seq {}", snapshot.seq);
        Ok(snapshot)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}
