//! Text search projection over compacted snapshots.
//!
//! The index is derived data: it is refreshed on every compaction and can be
//! rebuilt from the latest persisted snapshot of each document. Its staleness
//! window is therefore the compaction interval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::merge::{DocState, MergeError};
use crate::storage::{PersistenceLog, StoreError};
use crate::types::{DocumentKey, SearchEntry, Snapshot};

/// Search limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Root text type projected into the index
    pub text_root: String,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_root: "content".into(),
            default_limit: 20,
            max_limit: 100,
        }
    }
}

/// A search request. `limit = None` uses the configured default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
    pub blip_id: Option<String>,
}

impl SearchQuery {
    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_blip(mut self, blip_id: impl Into<String>) -> Self {
        self.blip_id = Some(blip_id.into());
        self
    }
}

/// In-memory text index keyed by document.
pub struct SearchIndexer {
    entries: RwLock<HashMap<DocumentKey, SearchEntry>>,
    config: SearchConfig,
}

impl SearchIndexer {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Project `snapshot` and upsert its entry.
    ///
    /// An older snapshot never replaces a newer entry.
    pub async fn index_snapshot(&self, snapshot: &Snapshot) -> Result<(), MergeError> {
        let text = DocState::from_snapshot(snapshot)?.text(&self.config.text_root);
        self.upsert(SearchEntry {
            key: snapshot.key.clone(),
            updated_at: snapshot.updated_at,
            text,
        })
        .await;
        Ok(())
    }

    /// Upsert an already projected entry.
    pub async fn upsert(&self, entry: SearchEntry) {
        let mut entries = self.entries.write().await;
        match entries.get(&entry.key) {
            Some(existing) if existing.updated_at > entry.updated_at => {}
            _ => {
                entries.insert(entry.key.clone(), entry);
            }
        }
    }

    pub async fn remove(&self, key: &DocumentKey) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Case-insensitive substring match, newest first.
    ///
    /// A blank query matches nothing. A missing or zero limit uses the
    /// default; anything else is clamped to `1..=max_limit`.
    pub async fn query(&self, query: &SearchQuery) -> Vec<SearchEntry> {
        let needle = query.q.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let limit = query
            .limit
            .filter(|&l| l > 0)
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1));

        let entries = self.entries.read().await;
        let mut hits: Vec<SearchEntry> = entries
            .values()
            .filter(|e| query.blip_id.as_ref().map_or(true, |b| *b == e.key.blip_id))
            .filter(|e| e.text.to_lowercase().contains(&needle))
            .cloned()
            .collect();

        hits.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        hits
    }

    /// Re-index from the latest persisted snapshot of every document.
    ///
    /// Snapshots that fail to decode are skipped and logged. Returns the
    /// number of indexed documents.
    pub async fn rebuild(&self, persistence: &PersistenceLog) -> Result<usize, StoreError> {
        let snapshots = persistence.latest_snapshots().await?;

        let mut fresh = HashMap::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            match DocState::from_snapshot(snapshot) {
                Ok(state) => {
                    fresh.insert(
                        snapshot.key.clone(),
                        SearchEntry {
                            key: snapshot.key.clone(),
                            updated_at: snapshot.updated_at,
                            text: state.text(&self.config.text_root),
                        },
                    );
                }
                Err(e) => log::warn!("Skipping snapshot of {} at seq {}: {e}", snapshot.key, snapshot.seq),
            }
        }

        let count = fresh.len();
        *self.entries.write().await = fresh;
        log::info!("Search index rebuilt with {count} document(s)");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for SearchIndexer {
    fn default() -> Self {
        Self::new(SearchConfig::default())
    }
}
