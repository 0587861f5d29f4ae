//! Session manager: live connections and fan-out to document members.
//!
//! ```text
//!                 ┌──────────────────┐
//!  connect() ───► │  SessionManager  │ ── join/leave ──► DocumentRegistry
//!                 │                  │
//!                 │ id → (doc key,   │
//!                 │       outbox)    │
//!                 └────────┬─────────┘
//!                          │ broadcast(doc, frame, exclude)
//!            ┌─────────────┼─────────────┐
//!            ▼             ▼             ▼
//!         outbox        outbox        outbox ──► writer task ──► socket
//! ```
//!
//! Every connection owns a bounded outbox drained by its own writer task,
//! so a broadcast never awaits a socket. A full or closed outbox counts as
//! a failed send: the member is collected during the pass and disconnected
//! once the pass completes.
//!
//! Frames broadcast from one source connection keep their relative order
//! because each connection's inbound loop is sequential and outboxes are
//! FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{awareness_removal_frame, ClientId};
use crate::registry::{Departure, Document, DocumentRegistry};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Message>;

/// Create an outbox with the given capacity.
pub fn outbox(capacity: usize) -> (Outbox, mpsc::Receiver<Message>) {
    mpsc::channel(capacity.max(1))
}

/// An awareness retraction that other server instances must hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retraction {
    pub doc_key: String,
    pub client_id: ClientId,
}

/// Result of disconnecting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub doc_key: String,
    pub departure: Departure,
}

/// Fan-out statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub frames_sent: u64,
    pub send_failures: u64,
}

struct Session {
    doc_key: String,
    outbox: Outbox,
}

/// Tracks live connections per document and performs fan-out.
pub struct SessionManager {
    registry: DocumentRegistry,
    sessions: RwLock<HashMap<ClientId, Session>>,
    next_id: AtomicU32,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    retractions: Mutex<Option<mpsc::UnboundedSender<Retraction>>>,
}

impl SessionManager {
    pub fn new(registry: DocumentRegistry) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            frames_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            retractions: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    /// Route awareness retractions to a consumer (the cross-instance bridge).
    pub fn set_retraction_sink(&self, sink: mpsc::UnboundedSender<Retraction>) {
        *self.retractions.lock() = Some(sink);
    }

    /// Take an identity from the connection id space without registering
    /// a session. Used to stand in for clients of other instances.
    pub fn reserve_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a connection on `doc_key` and return its fresh identity.
    pub fn connect(&self, outbox: Outbox, doc_key: &str) -> ClientId {
        let client_id = self.reserve_id();
        self.sessions.write().insert(
            client_id,
            Session {
                doc_key: doc_key.to_string(),
                outbox,
            },
        );
        let doc = self.registry.join(doc_key, client_id);
        log::info!(
            "Client {client_id} joined document {doc_key} ({} members)",
            doc.member_count()
        );
        client_id
    }

    /// Remove a connection. Retracts its awareness from remaining members.
    ///
    /// Returns `None` if the session was already gone.
    pub fn disconnect(&self, client_id: ClientId) -> Option<Disconnected> {
        let session = self.sessions.write().remove(&client_id)?;
        let departure = self
            .registry
            .leave(&session.doc_key, client_id)
            .unwrap_or(Departure {
                awareness_removed: false,
                remaining: 0,
            });

        log::info!(
            "Client {client_id} left document {} ({} remaining)",
            session.doc_key,
            departure.remaining
        );

        if departure.awareness_removed {
            let frame = Message::Binary(awareness_removal_frame(client_id).into());
            self.broadcast(&session.doc_key, frame, None);
            if let Some(sink) = self.retractions.lock().as_ref() {
                let _ = sink.send(Retraction {
                    doc_key: session.doc_key.clone(),
                    client_id,
                });
            }
        }

        Some(Disconnected {
            doc_key: session.doc_key,
            departure,
        })
    }

    /// Send `frame` to every member of `doc_key` except `exclude`.
    ///
    /// Returns the number of members the frame was queued for. Members whose
    /// outbox rejects the frame are disconnected after the pass.
    pub fn broadcast(&self, doc_key: &str, frame: Message, exclude: Option<ClientId>) -> usize {
        let Some(doc) = self.registry.get(doc_key) else {
            return 0;
        };
        let targets: Vec<(ClientId, Outbox)> = {
            let members: Vec<ClientId> = doc
                .lock()
                .members
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect();
            let sessions = self.sessions.read();
            members
                .into_iter()
                .filter_map(|id| sessions.get(&id).map(|s| (id, s.outbox.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, outbox) in targets {
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::debug!("Send to client {id} on {doc_key} failed: {e}");
                    failed.push(id);
                }
            }
        }

        self.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        if !failed.is_empty() {
            self.send_failures
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            for id in failed {
                log::warn!("Dropping unresponsive client {id} from {doc_key}");
                self.disconnect(id);
            }
        }
        delivered
    }

    /// Send `frame` to a single session. A failed send disconnects it.
    pub fn send_to(&self, client_id: ClientId, frame: Message) -> bool {
        let outbox = match self.sessions.read().get(&client_id) {
            Some(session) => session.outbox.clone(),
            None => return false,
        };
        match outbox.try_send(frame) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("Reply to client {client_id} failed: {e}");
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                self.disconnect(client_id);
                false
            }
        }
    }

    pub fn is_connected(&self, client_id: ClientId) -> bool {
        self.sessions.read().contains_key(&client_id)
    }

    pub fn doc_key(&self, client_id: ClientId) -> Option<String> {
        self.sessions
            .read()
            .get(&client_id)
            .map(|s| s.doc_key.clone())
    }

    /// The live document a session is attached to.
    pub fn document_of(&self, client_id: ClientId) -> Option<Arc<Document>> {
        let key = self.doc_key(client_id)?;
        self.registry.get(&key)
    }

    /// Member ids of `doc_key`, sorted.
    pub fn members(&self, doc_key: &str) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .registry
            .get(doc_key)
            .map(|doc| doc.lock().members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.session_count(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(frame: Message) -> Vec<u8> {
        match frame {
            Message::Binary(bytes) => bytes.to_vec(),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn test_identities_are_monotonic() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx, _rx) = outbox(8);
        let a = manager.connect(tx.clone(), "doc");
        let b = manager.connect(tx.clone(), "doc");
        let c = manager.connect(tx, "other");
        assert!(a < b && b < c);
        assert_eq!(manager.members("doc"), vec![a, b]);
        assert_eq!(manager.doc_key(c).as_deref(), Some("other"));
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx_a, mut rx_a) = outbox(8);
        let (tx_b, mut rx_b) = outbox(8);
        let (tx_c, mut rx_c) = outbox(8);
        let a = manager.connect(tx_a, "doc");
        manager.connect(tx_b, "doc");
        manager.connect(tx_c, "elsewhere");

        let count = manager.broadcast("doc", Message::Binary(vec![0, 2, 1].into()), Some(a));
        assert_eq!(count, 1);
        assert_eq!(binary(rx_b.try_recv().unwrap()), vec![0, 2, 1]);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broken_member_does_not_abort_fan_out() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx_a, _rx_a) = outbox(8);
        let (tx_b, rx_b) = outbox(8);
        let (tx_c, mut rx_c) = outbox(8);
        let a = manager.connect(tx_a, "doc");
        let b = manager.connect(tx_b, "doc");
        let c = manager.connect(tx_c, "doc");
        drop(rx_b);

        let count = manager.broadcast("doc", Message::Binary(vec![7].into()), Some(a));
        assert_eq!(count, 1);
        assert_eq!(binary(rx_c.try_recv().unwrap()), vec![7]);

        // The broken member was removed after the pass.
        assert!(!manager.is_connected(b));
        assert_eq!(manager.members("doc"), vec![a, c]);
        assert_eq!(manager.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn test_full_outbox_counts_as_failure() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx_a, _rx_a) = outbox(1);
        let (tx_b, _rx_b) = outbox(8);
        let a = manager.connect(tx_a, "doc");
        let b = manager.connect(tx_b, "doc");

        assert_eq!(manager.broadcast("doc", Message::Binary(vec![1].into()), Some(b)), 1);
        assert_eq!(manager.broadcast("doc", Message::Binary(vec![2].into()), Some(b)), 0);
        assert!(!manager.is_connected(a));
    }

    #[tokio::test]
    async fn test_disconnect_retracts_awareness() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (sink, mut retractions) = mpsc::unbounded_channel();
        manager.set_retraction_sink(sink);

        let (tx_a, _rx_a) = outbox(8);
        let (tx_b, mut rx_b) = outbox(8);
        let (tx_c, mut rx_c) = outbox(8);
        let a = manager.connect(tx_a, "doc");
        manager.connect(tx_b, "doc");
        manager.connect(tx_c, "doc");
        manager.document_of(a).unwrap().lock().awareness.set(a, vec![42]);

        let result = manager.disconnect(a).unwrap();
        assert!(result.departure.awareness_removed);
        assert_eq!(result.departure.remaining, 2);

        let expected = awareness_removal_frame(a);
        assert_eq!(binary(rx_b.try_recv().unwrap()), expected);
        assert_eq!(binary(rx_c.try_recv().unwrap()), expected);
        assert_eq!(
            retractions.try_recv().unwrap(),
            Retraction { doc_key: "doc".into(), client_id: a }
        );
        assert!(manager.disconnect(a).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_without_awareness_is_silent() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx_a, _rx_a) = outbox(8);
        let (tx_b, mut rx_b) = outbox(8);
        let a = manager.connect(tx_a, "doc");
        manager.connect(tx_b, "doc");

        let result = manager.disconnect(a).unwrap();
        assert!(!result.departure.awareness_removed);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_closed_session_disconnects() {
        let manager = SessionManager::new(DocumentRegistry::with_defaults());
        let (tx, rx) = outbox(8);
        let id = manager.connect(tx, "doc");
        drop(rx);
        assert!(!manager.send_to(id, Message::Binary(vec![1].into())));
        assert!(!manager.is_connected(id));
        assert!(!manager.send_to(id, Message::Binary(vec![1].into())));
    }
}
