//! WebSocket realtime server in front of the [`SyncEngine`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── DocumentRegistry (per-key mutex)
//!             ├── connection task ───┤── PersistenceLog ── EntryStore (RocksDB)
//! Client B ──┘        │              └── BroadcastFanout (room per key)
//!                     │                        │
//!                     ◄── forwarder task per subscription (Delta / Resync)
//! ```
//!
//! Each connection owns one outbound queue. Every subscription runs a
//! forwarder task that turns fan-out events into `Delta` frames; a forwarder
//! that lags resyncs its replica from the durable log before continuing.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{FanoutError, Subscription};
use crate::engine::{EngineConfig, SyncEngine, SyncError};
use crate::ingest::ValidatedUpdate;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::storage::{StoreConfig, StoreError};
use crate::types::DocumentKey;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Maximum concurrent subscriptions per connection
    pub max_subscriptions: usize,
    /// Outbound frames queued per connection
    pub outbound_capacity: usize,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            max_subscriptions: 64,
            outbound_capacity: 1024,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),
    #[error("Failed to parse config file: {0}")]
    Parse(String),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub resyncs_served: u64,
}

/// The realtime server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let engine = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                SyncEngine::open_rocks(config.engine.clone(), store_config)?
            }
            None => SyncEngine::in_memory(config.engine.clone()),
        };
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Serve an existing engine.
    pub fn with_engine(config: ServerConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let engine = Arc::new(SyncEngine::in_memory(config.engine.clone()));
        Self::with_engine(config, engine)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Start the engine and accept connections on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.engine.start().await?;

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = Arc::clone(&self.engine);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let session = Uuid::new_v4().to_string();
        log::info!("WebSocket connection established from {addr} (session {session})");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config.outbound_capacity.max(1));
        let mut connection = Connection {
            session,
            engine,
            stats: Arc::clone(&stats),
            out: out_tx,
            forwarders: HashMap::new(),
            max_subscriptions: config.max_subscriptions,
        };

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let reply = match ClientMessage::decode(&data) {
                                    Ok(msg) => connection.handle(msg).await,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        Some(ServerMessage::error(400, e.to_string()))
                                    }
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Text(_))) => {
                                let reply = ServerMessage::error(400, ProtocolError::UnexpectedText.to_string());
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing fan-out and resync frames
                    Some(out) = out_rx.recv() => {
                        ws_sender.send(Message::Binary(out.encode()?.into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Disconnect cancels only this connection's subscriptions
        connection.close().await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}

/// Per-connection state.
struct Connection {
    session: String,
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
    out: mpsc::Sender<ServerMessage>,
    forwarders: HashMap<DocumentKey, JoinHandle<()>>,
    max_subscriptions: usize,
}

impl Connection {
    /// Handle one client message, returning the direct reply if any.
    async fn handle(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Subscribe { wave_id, blip_id, from_seq } => {
                let key = DocumentKey::new(wave_id, blip_id);
                self.subscribe(key, from_seq).await
            }

            ClientMessage::Unsubscribe { wave_id, blip_id } => {
                let key = DocumentKey::new(wave_id, blip_id);
                if let Some(task) = self.forwarders.remove(&key) {
                    task.abort();
                }
                self.engine.unsubscribe(&key, &self.session).await;
                None
            }

            ClientMessage::Update { client_seq, wave_id, blip_id, delta } => {
                let key = DocumentKey::new(wave_id, blip_id);
                let result = match ValidatedUpdate::new(key.clone(), client_seq, delta) {
                    Ok(update) => self.engine.ingest(update, &self.session).await,
                    Err(e) => Err(SyncError::from(e)),
                };
                let (seq, status) = match &result {
                    Ok(outcome) => (Some(outcome.seq()), outcome.status()),
                    Err(e) => (None, e.status()),
                };
                {
                    let mut s = self.stats.write().await;
                    match result {
                        Ok(_) => s.updates_accepted += 1,
                        Err(_) => s.updates_rejected += 1,
                    }
                }
                Some(ServerMessage::ack(&key, client_seq, seq, status))
            }

            ClientMessage::Resync { wave_id, blip_id, from_seq } => {
                let key = DocumentKey::new(wave_id, blip_id);
                Some(match self.engine.resync(&key, from_seq).await {
                    Ok(items) => {
                        self.stats.write().await.resyncs_served += 1;
                        ServerMessage::resync(&key, items)
                    }
                    Err(e) => ServerMessage::error(e.status(), e.to_string()),
                })
            }

            ClientMessage::Ping => Some(ServerMessage::Pong),
        }
    }

    async fn subscribe(&mut self, key: DocumentKey, from_seq: Option<u64>) -> Option<ServerMessage> {
        if self.forwarders.contains_key(&key) {
            return None;
        }
        if self.forwarders.len() >= self.max_subscriptions {
            return Some(ServerMessage::error(
                429,
                format!("subscription limit {} reached", self.max_subscriptions),
            ));
        }

        // Join first so nothing published during the resync is missed
        let mut sub = self
            .engine
            .subscribe(&key, &self.session, from_seq.unwrap_or(0))
            .await;

        let mut reply = None;
        if let Some(from) = from_seq {
            match self.engine.resync(&key, from).await {
                Ok(items) => {
                    if let Some(last) = items.last() {
                        sub.mark_delivered(last.seq);
                    }
                    reply = Some(ServerMessage::resync(&key, items));
                }
                Err(e) => {
                    self.engine.unsubscribe(&key, &self.session).await;
                    return Some(ServerMessage::error(e.status(), e.to_string()));
                }
            }
        }

        let task = tokio::spawn(forward(sub, Arc::clone(&self.engine), self.out.clone()));
        self.forwarders.insert(key, task);
        reply
    }

    async fn close(&mut self) {
        for (key, task) in self.forwarders.drain() {
            task.abort();
            self.engine.unsubscribe(&key, &self.session).await;
        }
    }
}

/// Forward fan-out events of one subscription to the connection's queue.
async fn forward(mut sub: Subscription, engine: Arc<SyncEngine>, out: mpsc::Sender<ServerMessage>) {
    loop {
        let msg = match sub.recv().await {
            Ok(event) => ServerMessage::delta(&event.key, event.seq, event.delta.clone()),
            Err(FanoutError::Lagged { .. }) => match engine.resync(sub.key(), sub.last_seq()).await {
                Ok(items) => {
                    if let Some(last) = items.last() {
                        sub.mark_delivered(last.seq);
                    }
                    ServerMessage::resync(sub.key(), items)
                }
                Err(e) => {
                    log::error!("Resync of {} for {} failed: {e}", sub.key(), sub.subscriber_id());
                    ServerMessage::error(e.status(), e.to_string())
                }
            },
            Err(FanoutError::Closed(_)) => break,
        };
        if out.send(msg).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_subscriptions, 64);
        assert_eq!(config.engine.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            bind_addr = "0.0.0.0:8080"
            storage_path = "/var/lib/wave"

            [engine]
            compaction_threshold = 50
            truncate_on_compact = true

            [engine.retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/wave")));
        assert_eq!(config.engine.compaction_threshold, 50);
        assert!(config.engine.truncate_on_compact);
        assert_eq!(config.engine.retry.max_attempts, 5);
        // Unset fields keep their defaults
        assert_eq!(config.engine.retry.initial_delay_ms, 100);
        assert_eq!(config.engine.idle_timeout_ms, 300_000);
    }

    #[test]
    fn test_config_from_toml_rejects_garbage() {
        assert!(matches!(
            ServerConfig::from_toml_str("bind_addr = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert_eq!(server.engine().registry().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.updates_accepted, 0);
    }
}
