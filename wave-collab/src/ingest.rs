//! JSON payloads for update ingestion and search.
//!
//! ```text
//! POST update  {"seq":3,"waveId":"w","blipId":"b","updateBlob":"<base64>"}
//!          ──► {"ok":true,"seq":41,"clientSeq":3}
//! GET  search  {"q":"term","limit":20,"blipId":"b"}
//!          ──► {"results":[{"waveId":"w","blipId":"b","updatedAt":1700000000000}]}
//! POST rebuild {"blipId":"b"}
//!          ──► {"ok":true,"waveId":"w","applied":7,"blips":[{"blipId":"b","seq":41,"applied":7}]}
//! ```
//!
//! The submitted `seq` is the submitter's own counter. It identifies
//! resubmissions from the same origin; the document seq is assigned by the
//! engine and returned as `seq`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::SearchQuery;
use crate::types::{DocumentKey, SearchEntry};

/// Rejected ingestion payloads. Maps to HTTP 400.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("seq must be >= 1, got {0}")]
    InvalidSeq(u64),
    #[error("updateBlob is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("updateBlob is empty")]
    EmptyBlob,
}

/// Wire shape of an update submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Submitter's sequence number, >= 1
    pub seq: u64,
    pub wave_id: String,
    pub blip_id: String,
    /// Base64 of the versioned delta envelope
    pub update_blob: String,
}

/// A validated update, ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpdate {
    pub key: DocumentKey,
    /// Idempotency key, unique per origin
    pub client_seq: u64,
    pub delta: Vec<u8>,
}

impl IngestRequest {
    pub fn new(key: &DocumentKey, client_seq: u64, delta: &[u8]) -> Self {
        Self {
            seq: client_seq,
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            update_blob: STANDARD.encode(delta),
        }
    }

    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string(self).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Check ids, seq and blob encoding.
    ///
    /// The blob's CRDT content is not inspected here; the merge engine
    /// rejects undecodable envelopes.
    pub fn validate(self) -> Result<ValidatedUpdate, ValidationError> {
        let delta = STANDARD
            .decode(self.update_blob.trim())
            .map_err(|e| ValidationError::InvalidBase64(e.to_string()))?;
        ValidatedUpdate::new(DocumentKey::new(self.wave_id, self.blip_id), self.seq, delta)
    }
}

impl ValidatedUpdate {
    /// Check ids, seq and blob presence of a decoded update.
    pub fn new(key: DocumentKey, client_seq: u64, delta: Vec<u8>) -> Result<Self, ValidationError> {
        if key.wave_id.trim().is_empty() {
            return Err(ValidationError::MissingField("waveId"));
        }
        if key.blip_id.trim().is_empty() {
            return Err(ValidationError::MissingField("blipId"));
        }
        if client_seq == 0 {
            return Err(ValidationError::InvalidSeq(client_seq));
        }
        if delta.is_empty() {
            return Err(ValidationError::EmptyBlob);
        }
        Ok(Self {
            key,
            client_seq,
            delta,
        })
    }
}

/// Body returned for an ingestion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub ok: bool,
    /// Document seq assigned to the update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    pub fn accepted(seq: u64, client_seq: u64) -> Self {
        Self {
            ok: true,
            seq: Some(seq),
            client_seq: Some(client_seq),
            duplicate: false,
            error: None,
        }
    }

    /// A resubmission; `seq` is the one assigned the first time.
    pub fn duplicate(seq: u64, client_seq: u64) -> Self {
        Self {
            duplicate: true,
            ..Self::accepted(seq, client_seq)
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            seq: None,
            client_seq: None,
            duplicate: false,
            error: Some(message.into()),
        }
    }
}

/// Wire shape of a search request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub q: String,
    pub limit: Option<usize>,
    pub blip_id: Option<String>,
}

impl SearchRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))
    }
}

impl From<SearchRequest> for SearchQuery {
    fn from(req: SearchRequest) -> Self {
        let blip_id = req
            .blip_id
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        SearchQuery {
            q: req.q,
            limit: req.limit,
            blip_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub wave_id: String,
    pub blip_id: String,
    pub updated_at: u64,
}

impl From<&SearchEntry> for SearchHit {
    fn from(entry: &SearchEntry) -> Self {
        Self {
            wave_id: entry.key.wave_id.clone(),
            blip_id: entry.key.blip_id.clone(),
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

impl From<&[SearchEntry]> for SearchResponse {
    fn from(entries: &[SearchEntry]) -> Self {
        Self {
            results: entries.iter().map(SearchHit::from).collect(),
        }
    }
}

/// Wire shape of a wave rebuild request; no blip rebuilds the whole wave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebuildRequest {
    pub blip_id: Option<String>,
}

impl RebuildRequest {
    /// An empty body means the whole wave.
    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let req: Self =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Ok(Self {
            blip_id: req
                .blip_id
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
        })
    }
}

/// One blip folded into a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuiltBlip {
    pub blip_id: String,
    /// Seq of the new snapshot
    pub seq: u64,
    /// Update records folded in since the previous snapshot
    pub applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildResponse {
    pub ok: bool,
    pub wave_id: String,
    /// Total over `blips`
    pub applied: u64,
    pub blips: Vec<RebuiltBlip>,
}

impl RebuildResponse {
    pub fn new(wave_id: impl Into<String>, blips: Vec<RebuiltBlip>) -> Self {
        Self {
            ok: true,
            wave_id: wave_id.into(),
            applied: blips.iter().map(|b| b.applied).sum(),
            blips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camel_case_payload() {
        let body = br#"{"seq":3,"waveId":"w1","blipId":"b1","updateBlob":"AQID"}"#;
        let update = IngestRequest::from_json(body).unwrap().validate().unwrap();

        assert_eq!(update.key, DocumentKey::new("w1", "b1"));
        assert_eq!(update.client_seq, 3);
        assert_eq!(update.delta, vec![1, 2, 3]);
    }

    #[test]
    fn test_request_encodes_blob() {
        let key = DocumentKey::new("w", "b");
        let req = IngestRequest::new(&key, 7, &[1, 2, 3]);
        let json = req.to_json().unwrap();
        assert!(json.contains(r#""updateBlob":"AQID""#));
        assert!(json.contains(r#""waveId":"w""#));
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(matches!(
            IngestRequest::from_json(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
        assert!(matches!(
            IngestRequest::from_json(br#"{"seq":-1,"waveId":"w","blipId":"b","updateBlob":"AQ=="}"#),
            Err(ValidationError::Malformed(_))
        ));

        let key = DocumentKey::new("w", "b");
        assert_eq!(
            IngestRequest::new(&key, 0, &[1]).validate(),
            Err(ValidationError::InvalidSeq(0))
        );
        assert_eq!(
            IngestRequest::new(&key, 1, &[]).validate(),
            Err(ValidationError::EmptyBlob)
        );

        let mut req = IngestRequest::new(&key, 1, &[1]);
        req.update_blob = "***".into();
        assert!(matches!(req.validate(), Err(ValidationError::InvalidBase64(_))));

        let req = IngestRequest::new(&DocumentKey::new(" ", "b"), 1, &[1]);
        assert_eq!(req.validate(), Err(ValidationError::MissingField("waveId")));
    }

    #[test]
    fn test_search_request_defaults() {
        let req = SearchRequest::from_json(br#"{"q":"hello","blipId":"  "}"#).unwrap();
        let query = SearchQuery::from(req);
        assert_eq!(query.q, "hello");
        assert_eq!(query.limit, None);
        assert_eq!(query.blip_id, None);
    }

    #[test]
    fn test_search_response_shape() {
        let entries = vec![SearchEntry {
            key: DocumentKey::new("w", "b"),
            updated_at: 42,
            text: "ignored".into(),
        }];
        let json = serde_json::to_string(&SearchResponse::from(entries.as_slice())).unwrap();
        assert_eq!(json, r#"{"results":[{"waveId":"w","blipId":"b","updatedAt":42}]}"#);
    }

    #[test]
    fn test_ingest_response_shape() {
        let json = serde_json::to_string(&IngestResponse::duplicate(4, 2)).unwrap();
        assert_eq!(json, r#"{"ok":true,"seq":4,"clientSeq":2,"duplicate":true}"#);
        let json = serde_json::to_string(&IngestResponse::accepted(5, 1)).unwrap();
        assert_eq!(json, r#"{"ok":true,"seq":5,"clientSeq":1}"#);
        let json = serde_json::to_string(&IngestResponse::failed("boom")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"boom"}"#);
    }

    #[test]
    fn test_rebuild_request_and_response() {
        assert_eq!(RebuildRequest::from_json(b"").unwrap().blip_id, None);
        assert_eq!(RebuildRequest::from_json(br#"{"blipId":" "}"#).unwrap().blip_id, None);
        assert_eq!(
            RebuildRequest::from_json(br#"{"blipId":"b1"}"#).unwrap().blip_id.as_deref(),
            Some("b1")
        );
        assert!(RebuildRequest::from_json(b"{").is_err());

        let resp = RebuildResponse::new(
            "w",
            vec![
                RebuiltBlip { blip_id: "a".into(), seq: 4, applied: 3 },
                RebuiltBlip { blip_id: "b".into(), seq: 2, applied: 0 },
            ],
        );
        assert_eq!(resp.applied, 3);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.starts_with(r#"{"ok":true,"waveId":"w","applied":3,"blips":[{"blipId":"a","seq":4,"applied":3}"#));
    }
}
