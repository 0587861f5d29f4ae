//! WebSocket client speaking the binary sync protocol and the control channel.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Update, state and awareness frames
//! - Control messages (edit, ping, analysis requests)
//! - Offline queue for updates made while disconnected
//!
//! The client does not interpret update blobs. It reports what the server
//! sends as [`SyncEvent`]s and leaves merging to the application.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::control::{ControlEvent, ControlMessage};
use crate::protocol::{
    split_tagged_awareness, sync_frame, sync_step1, ClientId, Frame, SyncStep, AWARENESS_REMOVED,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("offline queue full")]
    QueueFull,
    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Server asked for our state (SYNC/STEP1)
    StateRequested,
    /// Full document state (SYNC/STEP2)
    State(Vec<u8>),
    /// Incremental update from another member (SYNC/UPDATE)
    Update(Vec<u8>),
    /// Presence of another member
    Awareness { client_id: ClientId, state: Vec<u8> },
    /// A member's presence was removed
    AwarenessRemoved(ClientId),
    /// Text frame from the control channel
    Control(ControlEvent),
    /// Connection lost
    Disconnected,
}

/// Updates made while disconnected, replayed in order on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns `false` when full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Put updates back at the front, ahead of anything queued since, in
    /// their original order. Ignores the size limit: they were admitted once.
    pub fn restore(&mut self, updates: Vec<Vec<u8>>) {
        for update in updates.into_iter().rev() {
            self.queue.push_front(update);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

fn binary(bytes: Vec<u8>) -> Message {
    Message::Binary(bytes.into())
}

/// Send queued updates to the writer task. If the writer goes away
/// partway, the unsent updates go back on the queue.
async fn replay_offline(
    queue: &Mutex<OfflineQueue>,
    out_tx: &mpsc::Sender<Message>,
) -> Result<usize, ClientError> {
    let queued = queue.lock().drain();
    let total = queued.len();
    let mut pending = queued.into_iter();
    while let Some(update) = pending.next() {
        let frame = binary(sync_frame(SyncStep::Update, &update));
        if out_tx.send(frame).await.is_err() {
            let mut unsent = vec![update];
            unsent.extend(pending);
            log::warn!("Connection closed during replay, {} updates requeued", unsent.len());
            queue.lock().restore(unsent);
            return Err(ClientError::ConnectionClosed);
        }
    }
    Ok(total)
}

/// Translate one server frame into an event. Unknown or malformed frames
/// yield `None`.
fn frame_event(message: Message) -> Option<SyncEvent> {
    match message {
        Message::Binary(data) => match Frame::decode(&data[..]).ok()? {
            Frame::Sync { step: SyncStep::Step1, .. } => Some(SyncEvent::StateRequested),
            Frame::Sync { step: SyncStep::Step2, payload } => Some(SyncEvent::State(payload.to_vec())),
            Frame::Sync { step: SyncStep::Update, payload } => {
                Some(SyncEvent::Update(payload.to_vec()))
            }
            Frame::Awareness { payload } => {
                let (client_id, state) = split_tagged_awareness(payload).ok()?;
                if state == AWARENESS_REMOVED {
                    Some(SyncEvent::AwarenessRemoved(client_id))
                } else {
                    Some(SyncEvent::Awareness {
                        client_id,
                        state: state.to_vec(),
                    })
                }
            }
            Frame::Auth { .. } | Frame::QueryAwareness => None,
        },
        Message::Text(text) => serde_json::from_str(text.as_str())
            .map(SyncEvent::Control)
            .map_err(|e| log::debug!("Ignoring control event: {e}"))
            .ok(),
        _ => None,
    }
}

/// The sync client.
pub struct SyncClient {
    doc_key: String,
    server_url: String,
    state: Arc<Mutex<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client for `doc_key` on a server such as `ws://127.0.0.1:8001`.
    pub fn new(server_url: impl Into<String>, doc_key: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            doc_key: doc_key.into(),
            server_url: server_url.into(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the reader and writer tasks. Queued offline
    /// updates are sent right after the connection opens.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.lock() = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.doc_key);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        match replay_offline(&self.offline_queue, &out_tx).await {
            Ok(0) => {}
            Ok(replayed) => log::info!("Replayed {replayed} queued updates"),
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(e);
            }
        }
        self.outgoing_tx = Some(out_tx);
        *self.state.lock() = ConnectionState::Connected;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(message) => {
                        if let Some(event) = frame_event(message) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            *state.lock() = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        log::debug!("Connected to {url}");
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send an incremental update. Queued while disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ClientError> {
        if self.connection_state() != ConnectionState::Connected {
            return if self.offline_queue.lock().enqueue(update) {
                Ok(())
            } else {
                Err(ClientError::QueueFull)
            };
        }
        self.send(binary(sync_frame(SyncStep::Update, &update))).await
    }

    /// Submit full local state (SYNC/STEP2).
    pub async fn send_state(&self, state: &[u8]) -> Result<(), ClientError> {
        self.send(binary(sync_frame(SyncStep::Step2, state))).await
    }

    /// Ask the server for the full document state (SYNC/STEP1).
    pub async fn request_state(&self) -> Result<(), ClientError> {
        self.send(binary(sync_step1())).await
    }

    pub async fn send_awareness(&self, state: &[u8]) -> Result<(), ClientError> {
        self.send(binary(Frame::Awareness { payload: state }.encode())).await
    }

    /// Remove our presence entry on the server.
    pub async fn clear_awareness(&self) -> Result<(), ClientError> {
        self.send_awareness(AWARENESS_REMOVED).await
    }

    pub async fn query_awareness(&self) -> Result<(), ClientError> {
        self.send(binary(Frame::QueryAwareness.encode())).await
    }

    pub async fn send_auth(&self, token: &[u8]) -> Result<(), ClientError> {
        self.send(binary(Frame::Auth { payload: token }.encode())).await
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(message)?;
        self.send(Message::Text(text.into())).await
    }

    /// Send arbitrary bytes as one binary frame.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.send(binary(bytes)).await
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.send(Message::Close(None)).await?;
        self.outgoing_tx = None;
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn doc_key(&self) -> &str {
        &self.doc_key
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().len()
    }
}
