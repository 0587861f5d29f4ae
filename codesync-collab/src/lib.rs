//! # codesync-collab — Real-time document sync relay
//!
//! Relays opaque CRDT update blobs and presence between WebSocket clients
//! editing the same document, optionally across several server processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐      pub/sub      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer   │ ◄───────────────► │ SyncServer   │
//! │ (per user)  │  binary + JSON text │ (instance A) │  doc:{key}:kind   │ (instance B) │
//! └─────────────┘                     └──────┬───────┘                   └──────────────┘
//!                                            │
//!                               ┌────────────┼─────────────┐
//!                               ▼            ▼             ▼
//!                        DocumentRegistry  SessionManager  ControlChannel
//!                        (UpdateLog,       (fan-out)       (debounced
//!                         AwarenessTable)                   analysis)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire framing
//! - [`update_log`] — Append-only update blobs with compaction
//! - [`awareness`] — Per-document presence table
//! - [`registry`] — Live documents and idle eviction
//! - [`session`] — Connections and fan-out
//! - [`engine`] — Sync protocol handling
//! - [`bridge`] — Cross-instance pub/sub relay
//! - [`debounce`] — Per-connection delayed side effects
//! - [`control`] — JSON control channel
//! - [`analysis`] — Code analysis service client
//! - [`storage`] — Document store (RocksDB or in-memory)
//! - [`config`] — Server configuration
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client with offline queue

pub mod analysis;
pub mod awareness;
pub mod bridge;
pub mod client;
pub mod config;
pub mod control;
pub mod debounce;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod update_log;

// Re-exports for convenience
pub use analysis::{AnalysisError, AnalysisService, HttpAnalysisService};
pub use awareness::AwarenessTable;
pub use bridge::{Bridge, BridgeError, Broker, MemoryBroker, RedisBroker};
pub use client::{ClientError, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{AnalysisConfig, ConfigError, ServerConfig};
pub use control::{ControlEvent, ControlMessage};
pub use debounce::DebounceScheduler;
pub use engine::SyncEngine;
pub use protocol::{ClientId, Frame, MessageType, ProtocolError, SyncStep};
pub use registry::{Document, DocumentRegistry};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::SessionManager;
pub use storage::{DocumentStore, MemoryDocumentStore, RocksDocumentStore, StoreError};
pub use update_log::UpdateLog;
