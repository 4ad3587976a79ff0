//! Core records shared by the merge engine, persistence and fan-out.
//!
//! ```text
//! DocumentKey ──► UpdateRecord (seq 1..n, immutable once persisted)
//!      │
//!      └────────► Snapshot (state folded up to seq)  ──►  SearchEntry
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifies one collaboratively edited blip within a wave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub wave_id: String,
    pub blip_id: String,
}

impl DocumentKey {
    pub fn new(wave_id: impl Into<String>, blip_id: impl Into<String>) -> Self {
        Self {
            wave_id: wave_id.into(),
            blip_id: blip_id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.wave_id, self.blip_id)
    }
}

/// A single incremental delta submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub key: DocumentKey,
    /// Assigned at ingress: `last_applied_seq + 1` under the document handle
    pub seq: u64,
    /// The submitter's own sequence number, its idempotency key; 0 if none
    pub client_seq: u64,
    /// Version-tagged delta envelope (see [`crate::merge`])
    pub delta: Vec<u8>,
    /// Milliseconds since epoch
    pub received_at: u64,
    /// Submitting client/session
    pub origin: String,
}

impl UpdateRecord {
    pub fn new(key: DocumentKey, seq: u64, delta: Vec<u8>, origin: impl Into<String>) -> Self {
        Self {
            key,
            seq,
            client_seq: 0,
            delta,
            received_at: now_millis(),
            origin: origin.into(),
        }
    }

    pub fn with_client_seq(mut self, client_seq: u64) -> Self {
        self.client_seq = client_seq;
        self
    }
}

/// Full document state folded from the update log up to `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: DocumentKey,
    pub seq: u64,
    pub state: Vec<u8>,
    pub updated_at: u64,
}

/// Derived search projection of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub key: DocumentKey,
    pub updated_at: u64,
    pub text: String,
}

/// One catch-up item: an update record's delta, or a snapshot's state blob
/// when the records below it were truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncItem {
    pub seq: u64,
    pub delta: Vec<u8>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
