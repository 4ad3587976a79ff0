//! Binary protocol for the realtime channel.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message
//! (serde mode, standard config):
//! ```text
//! client ──► server   Subscribe | Unsubscribe | Update | Resync | Ping
//! server ──► client   Delta | Resync | Ack | Error | Pong
//! ```
//!
//! `delta` fields carry the versioned envelopes of [`crate::merge`] untouched.
//! `seq` is always the document seq assigned by the server; `client_seq` is
//! the replica's own counter for its `Update`s, echoed back in the `Ack`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DocumentKey, ResyncItem};

/// Messages sent by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a document's room. With `from_seq`, a resync follows immediately.
    Subscribe {
        wave_id: String,
        blip_id: String,
        from_seq: Option<u64>,
    },
    Unsubscribe { wave_id: String, blip_id: String },
    Update {
        client_seq: u64,
        wave_id: String,
        blip_id: String,
        delta: Vec<u8>,
    },
    Resync {
        wave_id: String,
        blip_id: String,
        from_seq: u64,
    },
    Ping,
}

/// Messages sent to a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// A delta merged from another client
    Delta {
        wave_id: String,
        blip_id: String,
        seq: u64,
        delta: Vec<u8>,
    },
    Resync {
        wave_id: String,
        blip_id: String,
        updates: Vec<ResyncItem>,
    },
    /// Outcome of an `Update`, with the HTTP-style status code.
    /// `seq` is the assigned document seq, `None` when rejected.
    Ack {
        wave_id: String,
        blip_id: String,
        client_seq: u64,
        seq: Option<u64>,
        status: u16,
    },
    Error { status: u16, message: String },
    Pong,
}

impl ClientMessage {
    pub fn subscribe(key: &DocumentKey, from_seq: Option<u64>) -> Self {
        Self::Subscribe {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            from_seq,
        }
    }

    pub fn unsubscribe(key: &DocumentKey) -> Self {
        Self::Unsubscribe {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
        }
    }

    pub fn update(key: &DocumentKey, client_seq: u64, delta: Vec<u8>) -> Self {
        Self::Update {
            client_seq,
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            delta,
        }
    }

    pub fn resync(key: &DocumentKey, from_seq: u64) -> Self {
        Self::Resync {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            from_seq,
        }
    }

    /// Document the message targets, `None` for `Ping`.
    pub fn key(&self) -> Option<DocumentKey> {
        match self {
            Self::Subscribe { wave_id, blip_id, .. }
            | Self::Unsubscribe { wave_id, blip_id }
            | Self::Update { wave_id, blip_id, .. }
            | Self::Resync { wave_id, blip_id, .. } => {
                Some(DocumentKey::new(wave_id.clone(), blip_id.clone()))
            }
            Self::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn delta(key: &DocumentKey, seq: u64, delta: Vec<u8>) -> Self {
        Self::Delta {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            seq,
            delta,
        }
    }

    pub fn resync(key: &DocumentKey, updates: Vec<ResyncItem>) -> Self {
        Self::Resync {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            updates,
        }
    }

    pub fn ack(key: &DocumentKey, client_seq: u64, seq: Option<u64>, status: u16) -> Self {
        Self::Ack {
            wave_id: key.wave_id.clone(),
            blip_id: key.blip_id.clone(),
            client_seq,
            seq,
            status,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::Error {
            status,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing byte(s) after message")]
    TrailingBytes(usize),
    #[error("Unexpected text frame")]
    UnexpectedText,
}
