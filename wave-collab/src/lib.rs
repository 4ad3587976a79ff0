//! # wave-collab — Collaborative blip synchronization engine
//!
//! Many replicas concurrently edit the same blip (a document inside a wave)
//! and converge on identical content through CRDT merge. Every accepted edit
//! is durably logged before it is acknowledged, periodically folded into a
//! snapshot, fanned out to the other subscribed replicas and projected into a
//! search index.
//!
//! ## Architecture
//!
//! ```text
//!  ingest (JSON / WebSocket)
//!          │
//!          ▼
//! ┌──────────────────┐  load   ┌────────────────┐       ┌─────────────┐
//! │ DocumentRegistry │ ◄────── │ PersistenceLog │ ────► │ EntryStore  │
//! │ (per-key mutex)  │ ──────► │ (retry+backoff)│       │ Rocks/Memory│
//! └────────┬─────────┘ append  └───────┬────────┘       └─────────────┘
//!          │ merge (DocState)          │ snapshots
//!          ▼                           ▼
//! ┌──────────────────┐          ┌──────────────┐
//! │ BroadcastFanout  │          │ SearchIndexer│
//! │ (room per key)   │          └──────────────┘
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`merge`] — Versioned blob envelope and deterministic CRDT merge
//! - [`storage`] — Update log, snapshots and the RocksDB / in-memory stores
//! - [`registry`] — Active documents, lifecycle and per-key locking
//! - [`broadcast`] — Room-based fan-out with log-backed resync
//! - [`search`] — Text projection of snapshots
//! - [`engine`] — Ingestion pipeline, compaction and idle sweeping
//! - [`ingest`] — JSON ingestion and search payloads
//! - [`protocol`] — Binary realtime protocol (bincode)
//! - [`server`] — WebSocket realtime server

pub mod types;
pub mod merge;
pub mod storage;
pub mod registry;
pub mod broadcast;
pub mod search;
pub mod ingest;
pub mod engine;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastFanout, DeltaEvent, FanoutError, Subscription};
pub use engine::{EngineConfig, IngestOutcome, SyncEngine, SyncError};
pub use ingest::{
    IngestRequest, IngestResponse, RebuildRequest, RebuildResponse, RebuiltBlip, SearchRequest,
    SearchResponse, ValidatedUpdate, ValidationError,
};
pub use merge::{DocState, MergeError, MergeOutcome, Replica};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::{DocumentRegistry, Lifecycle, RecentSubmissions};
pub use search::{SearchConfig, SearchIndexer, SearchQuery};
pub use server::{ServerConfig, SyncServer};
pub use storage::{
    EntryStore, LoadError, MemoryStore, PersistenceError, PersistenceLog, RetryConfig,
    RocksStore, StoreConfig, StoreError,
};
pub use types::{DocumentKey, ResyncItem, SearchEntry, Snapshot, UpdateRecord};
