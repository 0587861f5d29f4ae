//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host/{doc_key}
//!        │
//!        ▼
//!   accept loop ──► connection task ──► SessionManager.connect ──► DocumentRegistry
//!                        │                                              │
//!                        │ binary ──► SyncEngine ──┬─► broadcast ──► outboxes
//!                        │                         └─► Bridge ──► broker (doc:{key}:*)
//!                        │ text   ──► ControlChannel ──► DebounceScheduler ──► AnalysisService
//!                        │                          └─► DocumentStore
//!                        ▼
//!                   writer task ◄── outbox
//! ```
//!
//! The document key is the last non-empty path segment of the upgrade
//! request (`/ws/42` and `/42` both select `"42"`); a bare `/` selects
//! `"default"`.
//!
//! Only a bind failure is fatal. Everything that goes wrong on a single
//! connection is logged and confined to that connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::analysis::{AnalysisError, AnalysisService, HttpAnalysisService};
use crate::bridge::{Bridge, BridgeError, BridgeStats, Broker, RedisBroker, RemoteSink};
use crate::config::ServerConfig;
use crate::control::{ControlChannel, ControlState};
use crate::engine::SyncEngine;
use crate::registry::{DocumentRegistry, RegistryStats};
use crate::session::{outbox, SessionManager, SessionStats};
use crate::storage::{
    DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError,
};

/// Document key used when the request path has no segments.
pub const DEFAULT_DOC_KEY: &str = "default";

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Failures while assembling the server's services.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("document store: {0}")]
    Store(#[from] StoreError),
    #[error("broker: {0}")]
    Bridge(#[from] BridgeError),
    #[error("analysis service: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub malformed_frames: u64,
    pub registry: RegistryStats,
    pub sessions: SessionStats,
    pub bridge: BridgeStats,
}

/// Last non-empty path segment, or [`DEFAULT_DOC_KEY`].
pub fn doc_key_from_path(path: &str) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(DEFAULT_DOC_KEY)
        .to_string()
}

struct ServerInner {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    engine: Arc<SyncEngine>,
    control: ControlChannel,
    shutdown: CancellationToken,
    bridge_started: AtomicBool,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    malformed_frames: AtomicU64,
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    inner: Arc<ServerInner>,
}

impl SyncServer {
    /// Build every service from configuration.
    ///
    /// `storage_path` selects RocksDB over the in-memory store and
    /// `redis_url` enables the cross-instance bridge.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksDocumentStore::open(StoreConfig::new(path))?),
            None => Arc::new(MemoryDocumentStore::new()),
        };
        let analysis = HttpAnalysisService::new(&config.analysis)?;
        let broker: Option<Arc<dyn Broker>> = match &config.redis_url {
            Some(url) => Some(Arc::new(RedisBroker::open(url)?)),
            None => None,
        };
        Ok(Self::with_components(config, store, Arc::new(analysis), broker))
    }

    /// Assemble a server from explicit collaborators.
    pub fn with_components(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        analysis: Arc<dyn AnalysisService>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Self {
        let registry = DocumentRegistry::new(config.idle_grace());
        let sessions = Arc::new(SessionManager::new(registry));
        let bridge = match broker {
            Some(broker) => Bridge::new(broker)
                .with_reconnect_backoff(config.broker_backoff())
                .with_broker_timeout(config.broker_timeout()),
            None => Bridge::disabled(),
        };
        let engine = Arc::new(SyncEngine::new(
            sessions.clone(),
            Arc::new(bridge),
            config.gc_ceiling,
        ));
        let control = ControlChannel::new(sessions.clone(), store, analysis, config.debounce());

        Self {
            inner: Arc::new(ServerInner {
                config,
                sessions,
                engine,
                control,
                shutdown: CancellationToken::new(),
                bridge_started: AtomicBool::new(false),
                total_connections: AtomicU64::new(0),
                active_connections: AtomicU64::new(0),
                malformed_frames: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.start_bridge();
        let inner = &self.inner;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(inner, stream, addr).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        log::info!("Sync server stopped");
        Ok(())
    }

    fn start_bridge(&self) {
        let inner = &self.inner;
        let bridge = inner.engine.bridge();
        if !bridge.is_enabled() || inner.bridge_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.sessions.set_retraction_sink(tx);

        let sink: Arc<dyn RemoteSink> = inner.engine.clone();
        let subscriber = bridge.clone();
        let token = inner.shutdown.clone();
        tokio::spawn(async move { subscriber.run(sink, token).await });

        let publisher = bridge.clone();
        let token = inner.shutdown.clone();
        tokio::spawn(async move { publisher.run_publisher(token).await });

        let forwarder = bridge.clone();
        let token = inner.shutdown.clone();
        tokio::spawn(async move { forwarder.forward_retractions(rx, token).await });

        log::info!("Cross-instance bridge {} started", bridge.instance_id());
    }

    async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream, addr: SocketAddr) {
        let mut path = String::new();
        let callback = |request: &Request, response: Response| {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        let doc_key = doc_key_from_path(&path);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        inner.total_connections.fetch_add(1, Ordering::Relaxed);
        inner.active_connections.fetch_add(1, Ordering::Relaxed);

        let (tx, mut rx) = outbox(inner.config.outbox_capacity);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_sender.send(message).await {
                    log::debug!("Write to {addr} failed: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let client_id = inner.sessions.connect(tx, &doc_key);
        log::info!("WebSocket connection from {addr} is client {client_id} on {doc_key}");
        inner.engine.on_connect(client_id);

        let mut control_state = ControlState::default();
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = inner.engine.handle_binary(client_id, &data[..]) {
                            inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping malformed frame from client {client_id}: {e}");
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        inner
                            .control
                            .handle_text(client_id, &mut control_state, text.as_str())
                            .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        inner.sessions.send_to(client_id, Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }
            // Dropped by a failed fan-out.
            if !inner.sessions.is_connected(client_id) {
                log::info!("Client {client_id} stopped draining its outbox; closing");
                break;
            }
        }

        // Cleanup
        inner.control.on_disconnect(&doc_key, client_id);
        inner.sessions.disconnect(client_id);
        inner.active_connections.fetch_sub(1, Ordering::Relaxed);
        if inner.shutdown.is_cancelled() {
            writer.abort();
        }

        let stats = inner.sessions.registry().stats();
        log::debug!(
            "Stats after client {client_id} left: {} documents, {} clients, {} updates",
            stats.documents,
            stats.clients,
            stats.updates
        );
    }

    /// Stop accepting, close every connection and cancel background timers.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.control.scheduler().cancel_all();
        inner.sessions.registry().shutdown();
        log::info!("Sync server shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    pub fn stats(&self) -> ServerStats {
        let inner = &self.inner;
        ServerStats {
            total_connections: inner.total_connections.load(Ordering::Relaxed),
            active_connections: inner.active_connections.load(Ordering::Relaxed),
            malformed_frames: inner.malformed_frames.load(Ordering::Relaxed),
            registry: inner.sessions.registry().stats(),
            sessions: inner.sessions.stats(),
            bridge: inner.engine.bridge().stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MemoryBroker;

    fn local_server() -> SyncServer {
        let config = ServerConfig::for_testing();
        let analysis = HttpAnalysisService::new(&config.analysis).unwrap();
        SyncServer::with_components(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(analysis),
            None,
        )
    }

    #[test]
    fn test_doc_key_from_path() {
        assert_eq!(doc_key_from_path("/ws/42"), "42");
        assert_eq!(doc_key_from_path("/doc-1"), "doc-1");
        assert_eq!(doc_key_from_path("/doc-1/"), "doc-1");
        assert_eq!(doc_key_from_path("/"), DEFAULT_DOC_KEY);
        assert_eq!(doc_key_from_path(""), DEFAULT_DOC_KEY);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = local_server();
        assert_eq!(server.stats(), ServerStats::default());
        assert!(!server.engine().bridge().is_enabled());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        assert!(SyncServer::new(config).is_ok());
        assert!(dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::for_testing()
        };
        let analysis = HttpAnalysisService::new(&config.analysis).unwrap();
        let server = SyncServer::with_components(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(analysis),
            None,
        );
        assert!(server.run().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = local_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(server.is_shutdown());
    }

    #[tokio::test]
    async fn test_bridge_enabled_with_broker() {
        let config = ServerConfig::for_testing();
        let analysis = HttpAnalysisService::new(&config.analysis).unwrap();
        let server = SyncServer::with_components(
            config,
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(analysis),
            Some(Arc::new(MemoryBroker::default())),
        );
        assert!(server.engine().bridge().is_enabled());
    }
}
