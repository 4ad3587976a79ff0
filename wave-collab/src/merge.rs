//! CRDT merge engine: deterministic, idempotent application of deltas.
//!
//! Every state and delta blob is a version-tagged envelope around a Yrs update:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ format   │ yrs update                   │
//! │ 1 byte   │ variable (lib0 v1 or v2)     │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! State blobs and delta blobs share the envelope, so a snapshot state can be
//! shipped to a replica as a catch-up delta.
//!
//! Concurrent inserts at the same position follow the YATA ordering of Yrs:
//! items sharing the same neighbours are ordered by ascending client id. The
//! order is total over (client id, clock) and never depends on arrival order.
//!
//! Nothing in this module performs I/O.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::types::{now_millis, DocumentKey, Snapshot, UpdateRecord};

/// Yrs update, lib0 v1 encoding. All blobs written by this crate use it.
pub const FORMAT_V1: u8 = 1;
/// Yrs update, lib0 v2 encoding. Accepted on ingest.
pub const FORMAT_V2: u8 = 2;

/// Merge errors. State is never mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("empty blob")]
    EmptyBlob,
    #[error("unsupported blob format {0}")]
    UnsupportedFormat(u8),
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("update could not be integrated: {0}")]
    Apply(String),
}

/// Wrap a raw v1 Yrs update in a versioned envelope.
pub fn wrap_v1(update: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(update.len() + 1);
    blob.push(FORMAT_V1);
    blob.extend_from_slice(update);
    blob
}

/// Wrap a raw v2 Yrs update in a versioned envelope.
pub fn wrap_v2(update: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(update.len() + 1);
    blob.push(FORMAT_V2);
    blob.extend_from_slice(update);
    blob
}

/// Decode a versioned envelope into a Yrs update.
pub fn decode_blob(blob: &[u8]) -> Result<Update, MergeError> {
    let (format, payload) = blob.split_first().ok_or(MergeError::EmptyBlob)?;
    let decoded = match *format {
        FORMAT_V1 => Update::decode_v1(payload),
        FORMAT_V2 => Update::decode_v2(payload),
        other => return Err(MergeError::UnsupportedFormat(other)),
    };
    decoded.map_err(|e| MergeError::Decode(e.to_string()))
}

/// Result of [`DocState::apply_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// `false` when the record's seq was already applied
    pub applied: bool,
    /// The delta that was merged (fan-out payload), `None` on no-op
    pub delta: Option<Vec<u8>>,
    pub last_applied_seq: u64,
}

/// In-memory CRDT state of one document.
pub struct DocState {
    doc: Doc,
    last_applied_seq: u64,
    last_updated_at: u64,
}

impl Default for DocState {
    fn default() -> Self {
        Self::new()
    }
}

impl DocState {
    /// Empty document at seq 0.
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            last_applied_seq: 0,
            last_updated_at: now_millis(),
        }
    }

    /// Rebuild from a state blob folded up to `seq`.
    pub fn from_state(state: &[u8], seq: u64, updated_at: u64) -> Result<Self, MergeError> {
        let update = decode_blob(state)?;
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| MergeError::Apply(e.to_string()))?;
        }
        Ok(Self {
            doc,
            last_applied_seq: seq,
            last_updated_at: updated_at,
        })
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, MergeError> {
        Self::from_state(&snapshot.state, snapshot.seq, snapshot.updated_at)
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.last_applied_seq
    }

    pub fn last_updated_at(&self) -> u64 {
        self.last_updated_at
    }

    /// Apply one update record with seq bookkeeping.
    ///
    /// A record whose seq is at or below `last_applied_seq` is a no-op and
    /// returns `applied = false`.
    pub fn apply_update(&mut self, record: &UpdateRecord) -> Result<MergeOutcome, MergeError> {
        if record.seq <= self.last_applied_seq {
            return Ok(MergeOutcome {
                applied: false,
                delta: None,
                last_applied_seq: self.last_applied_seq,
            });
        }

        self.merge_delta(&record.delta)?;
        self.last_applied_seq = record.seq;
        self.last_updated_at = record.received_at.max(self.last_updated_at);

        Ok(MergeOutcome {
            applied: true,
            delta: Some(record.delta.clone()),
            last_applied_seq: self.last_applied_seq,
        })
    }

    /// Merge a delta without seq bookkeeping.
    ///
    /// Commutative, associative and idempotent over the Yrs update set.
    pub fn merge_delta(&mut self, delta: &[u8]) -> Result<(), MergeError> {
        let update = decode_blob(delta)?;

        // Integration failures can leave the block store half-applied.
        let before = self.encode_state();
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };

        if let Err(e) = result {
            self.doc = restore_doc(Doc::with_client_id(self.doc.client_id()), &before)?;
            return Err(MergeError::Apply(e.to_string()));
        }
        Ok(())
    }

    /// Full state as a v1 envelope.
    pub fn state_blob(&self) -> Vec<u8> {
        wrap_v1(&self.encode_state())
    }

    /// Plain text of the named root text type, empty if absent.
    pub fn text(&self, root: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(root)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Capture a snapshot at the current `last_applied_seq`.
    pub fn to_snapshot(&self, key: &DocumentKey) -> Snapshot {
        Snapshot {
            key: key.clone(),
            seq: self.last_applied_seq,
            state: self.state_blob(),
            updated_at: self.last_updated_at,
        }
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

fn restore_doc(doc: Doc, state: &[u8]) -> Result<Doc, MergeError> {
    let update = Update::decode_v1(state).map_err(|e| MergeError::Decode(e.to_string()))?;
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(e.to_string()))?;
    }
    Ok(doc)
}

/// An editing replica: owns a local Yrs doc and produces enveloped deltas.
///
/// Used by clients and tests to author edits against the engine.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    /// Replica with a fixed Yrs client id (the tie-break key).
    pub fn new(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id.into()),
        }
    }

    /// Insert `text` at `index` of the root text `root`, returning the delta.
    pub fn insert(&self, root: &str, index: u32, text: &str) -> Vec<u8> {
        let sv = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let content = txn.get_or_insert_text(root);
            content.insert(&mut txn, index, text);
        }
        let txn = self.doc.transact();
        wrap_v1(&txn.encode_state_as_update_v1(&sv))
    }

    /// Append `text` at the end of the root text `root`, returning the delta.
    pub fn append(&self, root: &str, text: &str) -> Vec<u8> {
        let len = {
            let txn = self.doc.transact();
            txn.get_text(root)
                .map(|t| t.len(&txn))
                .unwrap_or(0)
        };
        self.insert(root, len, text)
    }

    /// Remove `len` characters at `index`, returning the delta.
    pub fn remove(&self, root: &str, index: u32, len: u32) -> Vec<u8> {
        let sv = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let content = txn.get_or_insert_text(root);
            content.remove_range(&mut txn, index, len);
        }
        let txn = self.doc.transact();
        wrap_v1(&txn.encode_state_as_update_v1(&sv))
    }

    /// Merge a delta received from elsewhere.
    pub fn apply(&self, delta: &[u8]) -> Result<(), MergeError> {
        let update = decode_blob(delta)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(e.to_string()))
    }

    pub fn text(&self, root: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(root)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "content";

    fn record(seq: u64, delta: Vec<u8>, origin: &str) -> UpdateRecord {
        UpdateRecord::new(DocumentKey::new("w", "b"), seq, delta, origin)
    }

    #[test]
    fn test_apply_update_advances_seq() {
        let editor = Replica::new(1);
        let mut state = DocState::new();

        let outcome = state
            .apply_update(&record(1, editor.insert(ROOT, 0, "hello"), "x"))
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.last_applied_seq, 1);
        assert!(outcome.delta.is_some());
        assert_eq!(state.text(ROOT), "hello");
    }

    #[test]
    fn test_stale_seq_is_noop() {
        let editor = Replica::new(1);
        let mut state = DocState::new();
        for seq in 1..=5 {
            state
                .apply_update(&record(seq, editor.append(ROOT, "x"), "x"))
                .unwrap();
        }
        let before = state.state_blob();

        // Resubmitting seq 3 with new content must not change anything
        let late = editor.append(ROOT, "LATE");
        let outcome = state.apply_update(&record(3, late, "x")).unwrap();

        assert!(!outcome.applied);
        assert!(outcome.delta.is_none());
        assert_eq!(outcome.last_applied_seq, 5);
        assert_eq!(state.state_blob(), before);
        assert_eq!(state.text(ROOT), "xxxxx");
    }

    #[test]
    fn test_concurrent_inserts_tie_break() {
        let x = Replica::new(1);
        let y = Replica::new(2);
        let dx = x.insert(ROOT, 0, "A");
        let dy = y.insert(ROOT, 0, "B");

        let mut first = DocState::new();
        first.apply_update(&record(1, dx.clone(), "x")).unwrap();
        first.apply_update(&record(2, dy.clone(), "y")).unwrap();

        let mut second = DocState::new();
        second.merge_delta(&dy).unwrap();
        second.merge_delta(&dx).unwrap();

        assert_eq!(first.text(ROOT), second.text(ROOT));
        assert_eq!(first.text(ROOT), "AB");
    }

    #[test]
    fn test_malformed_blob_leaves_state_untouched() {
        let editor = Replica::new(1);
        let mut state = DocState::new();
        state
            .apply_update(&record(1, editor.insert(ROOT, 0, "keep"), "x"))
            .unwrap();
        let before = state.state_blob();

        let err = state
            .apply_update(&record(2, vec![FORMAT_V1, 0xFF, 0xFE, 0xFD], "x"))
            .unwrap_err();
        assert!(matches!(err, MergeError::Decode(_)));
        assert_eq!(state.last_applied_seq(), 1);
        assert_eq!(state.state_blob(), before);
    }

    #[test]
    fn test_envelope_rejections() {
        assert_eq!(decode_blob(&[]).unwrap_err(), MergeError::EmptyBlob);
        assert_eq!(
            decode_blob(&[9, 0, 0]).unwrap_err(),
            MergeError::UnsupportedFormat(9)
        );
    }

    #[test]
    fn test_v2_envelope_accepted() {
        let doc = Doc::with_client_id(7u64.into());
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text(ROOT);
            text.insert(&mut txn, 0, "v2 payload");
        }
        let update = {
            let txn = doc.transact();
            txn.encode_state_as_update_v2(&StateVector::default())
        };

        let mut state = DocState::new();
        state.merge_delta(&wrap_v2(&update)).unwrap();
        assert_eq!(state.text(ROOT), "v2 payload");
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_seq_and_text() {
        let editor = Replica::new(3);
        let mut state = DocState::new();
        state
            .apply_update(&record(4, editor.insert(ROOT, 0, "snap"), "x"))
            .unwrap();

        let key = DocumentKey::new("w", "b");
        let snapshot = state.to_snapshot(&key);
        assert_eq!(snapshot.seq, 4);

        let restored = DocState::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.last_applied_seq(), 4);
        assert_eq!(restored.text(ROOT), "snap");
    }

    #[test]
    fn test_state_blob_is_valid_delta() {
        let editor = Replica::new(1);
        let mut state = DocState::new();
        state.merge_delta(&editor.insert(ROOT, 0, "catch up")).unwrap();

        let fresh = Replica::new(99);
        fresh.apply(&state.state_blob()).unwrap();
        assert_eq!(fresh.text(ROOT), "catch up");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let editor = Replica::new(1);
        let delta = editor.insert(ROOT, 0, "once");

        let mut state = DocState::new();
        state.merge_delta(&delta).unwrap();
        state.merge_delta(&delta).unwrap();
        assert_eq!(state.text(ROOT), "once");
    }

    #[test]
    fn test_replica_remove() {
        let editor = Replica::new(1);
        let mut state = DocState::new();
        state.merge_delta(&editor.insert(ROOT, 0, "hello world")).unwrap();
        state.merge_delta(&editor.remove(ROOT, 5, 6)).unwrap();
        assert_eq!(state.text(ROOT), "hello");
    }

    #[test]
    fn test_missing_root_is_empty_text() {
        let state = DocState::new();
        assert_eq!(state.text("nothing-here"), "");
    }
}
