//! Sync protocol engine.
//!
//! Per-connection handshake is fire-and-forget:
//! ```text
//!  server                                   client
//!    │── SYNC/STEP1 ─────────────────────────►│  on connect
//!    │── SYNC/STEP2 (full state, if any) ────►│
//!    │── AWARENESS × n (stored presence) ────►│
//!    │                                        │
//!    │◄──────────────── SYNC/STEP2 | UPDATE ──│  append, fan out, publish, gc
//!    │◄──────────────────────── SYNC/STEP1 ───│  reply STEP2
//!    │◄───────────────────────── AWARENESS ───│  store, fan out, publish
//!    │◄─────────────────── QUERY_AWARENESS ───│  reply AWARENESS × n
//! ```
//! There is no HANDSHAKING state that gates updates: a connection is
//! synced as soon as it is registered.
//!
//! STEP2 always carries the entire encoded state. No state-vector diffing
//! is performed; the update log is compacted instead.
//!
//! Nothing here waits on the network: outbound frames go to bounded
//! outboxes and bridged events to the bridge's publish queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::{Bridge, BridgeEvent, EventKind, RemoteSink};
use crate::protocol::{
    awareness_frame, sync_frame, sync_step1, ClientId, Frame, ProtocolError, SyncStep,
    AWARENESS_REMOVED,
};
use crate::registry::Document;
use crate::session::SessionManager;
use crate::update_log::DEFAULT_GC_CEILING;

fn binary(bytes: Vec<u8>) -> Message {
    Message::Binary(bytes.into())
}

/// Applies inbound binary frames to document state and routes the results.
pub struct SyncEngine {
    sessions: Arc<SessionManager>,
    bridge: Arc<Bridge>,
    gc_ceiling: usize,
    /// Local stand-in ids for clients of other instances
    remote_ids: Mutex<HashMap<(Uuid, ClientId), ClientId>>,
}

impl SyncEngine {
    pub fn new(sessions: Arc<SessionManager>, bridge: Arc<Bridge>, gc_ceiling: usize) -> Self {
        Self {
            sessions,
            bridge,
            gc_ceiling,
            remote_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Engine with no broker and the default gc ceiling.
    pub fn local(sessions: Arc<SessionManager>) -> Self {
        Self::new(sessions, Arc::new(Bridge::disabled()), DEFAULT_GC_CEILING)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Send the opening handshake to a freshly registered connection.
    pub fn on_connect(&self, client_id: ClientId) {
        let Some(doc) = self.sessions.document_of(client_id) else {
            return;
        };
        let (state, presence) = {
            let state = doc.lock();
            (state.updates.encoded_state(), state.awareness.snapshot())
        };

        if !self.sessions.send_to(client_id, binary(sync_step1())) {
            return;
        }
        if !state.is_empty() {
            log::debug!(
                "Sending {} bytes of state to client {client_id} on {}",
                state.len(),
                doc.key()
            );
            self.sessions
                .send_to(client_id, binary(sync_frame(SyncStep::Step2, &state)));
        }
        for (id, blob) in presence {
            self.sessions
                .send_to(client_id, binary(awareness_frame(id, &blob)));
        }
    }

    /// Handle one inbound binary frame.
    ///
    /// A malformed frame yields `Err` and leaves every piece of state
    /// untouched; the caller logs it and keeps the connection open.
    pub fn handle_binary(&self, client_id: ClientId, bytes: &[u8]) -> Result<(), ProtocolError> {
        let frame = Frame::decode(bytes)?;
        let Some(doc) = self.sessions.document_of(client_id) else {
            return Ok(());
        };

        match frame {
            Frame::Sync { step: SyncStep::Step1, .. } => {
                let state = doc.encoded_state();
                self.sessions
                    .send_to(client_id, binary(sync_frame(SyncStep::Step2, &state)));
            }
            Frame::Sync { step: SyncStep::Step2 | SyncStep::Update, payload } => {
                if !payload.is_empty() {
                    self.apply_update(&doc, client_id, payload);
                }
            }
            Frame::Awareness { payload } => {
                self.apply_awareness(&doc, client_id, payload);
            }
            Frame::QueryAwareness => {
                let presence = doc.lock().awareness.snapshot();
                for (id, blob) in presence {
                    self.sessions
                        .send_to(client_id, binary(awareness_frame(id, &blob)));
                }
            }
            Frame::Auth { payload } => {
                log::debug!(
                    "Ignoring {}-byte auth frame from client {client_id}",
                    payload.len()
                );
            }
        }
        Ok(())
    }

    fn apply_update(&self, doc: &Document, client_id: ClientId, payload: &[u8]) {
        doc.lock().updates.append(payload.to_vec());
        let relayed = self.sessions.broadcast(
            doc.key(),
            binary(sync_frame(SyncStep::Update, payload)),
            Some(client_id),
        );
        log::trace!(
            "Update of {} bytes from client {client_id} relayed to {relayed} members",
            payload.len()
        );
        self.bridge.publish_update(doc.key(), client_id, payload);
        self.collect_garbage(doc);
    }

    fn apply_awareness(&self, doc: &Document, client_id: ClientId, payload: &[u8]) {
        {
            let mut state = doc.lock();
            if payload == AWARENESS_REMOVED {
                state.awareness.remove(client_id);
            } else {
                state.awareness.set(client_id, payload.to_vec());
            }
        }
        self.sessions.broadcast(
            doc.key(),
            binary(awareness_frame(client_id, payload)),
            Some(client_id),
        );
        self.bridge.publish_awareness(doc.key(), client_id, payload);
    }

    /// Map a client of another instance to a local id, allocating one on
    /// first sight. A removal releases the mapping; removing a client never
    /// seen yields `None`.
    fn local_id_for(&self, origin: Uuid, sender: ClientId, removal: bool) -> Option<ClientId> {
        let mut ids = self.remote_ids.lock();
        if removal {
            return ids.remove(&(origin, sender));
        }
        Some(
            *ids.entry((origin, sender))
                .or_insert_with(|| self.sessions.reserve_id()),
        )
    }

    /// Number of remote clients currently mapped to local ids.
    pub fn remote_client_count(&self) -> usize {
        self.remote_ids.lock().len()
    }

    fn collect_garbage(&self, doc: &Document) {
        let mut state = doc.lock();
        if state.updates.gc(self.gc_ceiling) {
            log::debug!(
                "Compacted update log of {} ({} bytes)",
                doc.key(),
                state.updates.byte_len()
            );
        }
    }
}

impl RemoteSink for SyncEngine {
    /// Fan out an event from another instance to local members.
    ///
    /// Documents not live in this process are skipped. Remote presence is
    /// relayed but not stored, tagged with a local id reserved for the
    /// remote client so it never collides with a local connection.
    fn apply_remote(&self, event: BridgeEvent) {
        let Some(doc) = self.sessions.registry().get(&event.doc_key) else {
            return;
        };
        match event.kind {
            EventKind::Update => {
                if event.payload.is_empty() {
                    return;
                }
                let frame = binary(sync_frame(SyncStep::Update, &event.payload));
                doc.lock().updates.append(event.payload);
                self.sessions.broadcast(doc.key(), frame, None);
                self.collect_garbage(&doc);
            }
            EventKind::Awareness => {
                let removal = event.payload == AWARENESS_REMOVED;
                let Some(local_id) = self.local_id_for(event.origin, event.sender, removal) else {
                    return;
                };
                self.sessions.broadcast(
                    doc.key(),
                    binary(awareness_frame(local_id, &event.payload)),
                    None,
                );
            }
        }
    }
}
