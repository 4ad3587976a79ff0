//! Fan-out of merged deltas to subscribed replicas, with log-backed resync.
//!
//! Each document key gets its own room: one tokio broadcast channel shared by
//! every subscriber of that key, so delivery order per key equals publish
//! order. Every subscriber holds an independent receiver buffering up to
//! `capacity` events; a receiver that falls further behind is told how many
//! events it missed and catches up through [`BroadcastFanout::resync`].
//!
//! Echo suppression happens on the receiving side: a [`Subscription`] skips
//! events whose origin is its own subscriber id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::RwLock;

use crate::storage::{PersistenceError, PersistenceLog};
use crate::types::{DocumentKey, ResyncItem};

/// One merged delta, in apply order for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEvent {
    pub key: DocumentKey,
    pub seq: u64,
    pub delta: Vec<u8>,
    /// Subscriber id of the submitting client
    pub origin: String,
}

/// Delivery failures. Best-effort: never fails the publishing ingest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanoutError {
    #[error("subscriber of {key} lagged behind by {missed} event(s)")]
    Lagged { key: DocumentKey, missed: u64 },
    #[error("room for {0} closed")]
    Closed(DocumentKey),
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub events_published: u64,
    pub events_lagged: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicFanoutStats {
    events_published: AtomicU64,
    events_lagged: AtomicU64,
}

struct Room {
    sender: broadcast::Sender<Arc<DeltaEvent>>,
    subscribers: HashSet<String>,
}

/// Receiving end for one subscriber on one key.
pub struct Subscription {
    key: DocumentKey,
    subscriber_id: String,
    receiver: broadcast::Receiver<Arc<DeltaEvent>>,
    /// Highest seq delivered or resynced
    last_seq: u64,
    stats: Arc<AtomicFanoutStats>,
}

impl Subscription {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Advance the delivery cursor after a resync.
    pub fn mark_delivered(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    /// Next event from another client.
    ///
    /// After [`FanoutError::Lagged`] the receiver keeps going from the oldest
    /// retained event; the caller should resync from [`Self::last_seq`].
    pub async fn recv(&mut self) -> Result<Arc<DeltaEvent>, FanoutError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Ok(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => return Err(self.lagged(missed)),
                Err(RecvError::Closed) => return Err(FanoutError::Closed(self.key.clone())),
            }
        }
    }

    /// Non-blocking variant of [`Self::recv`]; `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Arc<DeltaEvent>>, FanoutError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(missed)) => return Err(self.lagged(missed)),
                Err(TryRecvError::Closed) => return Err(FanoutError::Closed(self.key.clone())),
            }
        }
    }

    fn accept(&mut self, event: Arc<DeltaEvent>) -> Option<Arc<DeltaEvent>> {
        // Already covered by a resync
        if event.seq <= self.last_seq {
            return None;
        }
        self.last_seq = event.seq;
        if event.origin == self.subscriber_id {
            return None;
        }
        Some(event)
    }

    fn lagged(&self, missed: u64) -> FanoutError {
        self.stats.events_lagged.fetch_add(missed, Ordering::Relaxed);
        log::warn!(
            "Subscriber {} of {} lagged by {missed} event(s)",
            self.subscriber_id,
            self.key
        );
        FanoutError::Lagged {
            key: self.key.clone(),
            missed,
        }
    }
}

/// Room manager: maps document keys to broadcast rooms.
pub struct BroadcastFanout {
    rooms: RwLock<HashMap<DocumentKey, Room>>,
    capacity: usize,
    log: Arc<PersistenceLog>,
    stats: Arc<AtomicFanoutStats>,
}

impl BroadcastFanout {
    /// `capacity` is the number of events buffered per subscriber before it lags.
    pub fn new(capacity: usize, log: Arc<PersistenceLog>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            log,
            stats: Arc::new(AtomicFanoutStats::default()),
        }
    }

    /// Join the room for `key`. Delivery starts with the next published event.
    ///
    /// `from_seq` seeds the delivery cursor; events at or below it are skipped.
    pub async fn subscribe(
        &self,
        key: &DocumentKey,
        subscriber_id: impl Into<String>,
        from_seq: u64,
    ) -> Subscription {
        let subscriber_id = subscriber_id.into();
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(key.clone()).or_insert_with(|| Room {
            sender: broadcast::channel(self.capacity).0,
            subscribers: HashSet::new(),
        });
        room.subscribers.insert(subscriber_id.clone());
        log::debug!("{subscriber_id} subscribed to {key}");

        Subscription {
            key: key.clone(),
            subscriber_id,
            receiver: room.sender.subscribe(),
            last_seq: from_seq,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Leave the room for `key`. Empty rooms are removed.
    pub async fn unsubscribe(&self, key: &DocumentKey, subscriber_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(key) else {
            return false;
        };
        let removed = room.subscribers.remove(subscriber_id);
        if room.subscribers.is_empty() {
            rooms.remove(key);
        }
        if removed {
            log::debug!("{subscriber_id} unsubscribed from {key}");
        }
        removed
    }

    /// Deliver to every receiver of the event's key. Never blocks.
    ///
    /// Returns the number of receivers the event was queued for.
    pub async fn publish(&self, event: DeltaEvent) -> usize {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&event.key) else {
            return 0;
        };
        let seq = event.seq;
        let count = room.sender.send(Arc::new(event)).unwrap_or(0);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        log::trace!("Published seq {seq} to {count} receiver(s)");
        count
    }

    /// Catch-up items for `key` with seq above `from_seq`.
    pub async fn resync(
        &self,
        key: &DocumentKey,
        from_seq: u64,
    ) -> Result<Vec<ResyncItem>, PersistenceError> {
        let items = self.log.updates_since(key, from_seq).await?;
        log::debug!("Resync {key} from {from_seq}: {} item(s)", items.len());
        Ok(items)
    }

    pub async fn subscriber_count(&self, key: &DocumentKey) -> usize {
        self.rooms
            .read()
            .await
            .get(key)
            .map_or(0, |room| room.subscribers.len())
    }

    /// Keys with at least one subscriber.
    pub async fn subscribed_keys(&self) -> HashSet<DocumentKey> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_lagged: self.stats.events_lagged.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
