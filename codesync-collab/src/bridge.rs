//! Cross-instance bridge over a pub/sub broker.
//!
//! ```text
//!  process A                          broker                         process B
//! ┌──────────┐  publish doc:k:update ┌────────┐  psubscribe doc:*  ┌──────────┐
//! │ SyncEngine├──────────────────────►│        ├───────────────────►│ Bridge   │
//! │          │                       │ Redis  │                    │ run()    │
//! │ Bridge   │◄──────────────────────┤        │◄───────────────────┤          │
//! └──────────┘                       └────────┘                    └────┬─────┘
//!                                                                       │ apply_remote
//!                                                                       ▼
//!                                                                  local members
//! ```
//!
//! Every event carries the publishing process's instance id. A process
//! ignores its own events because local fan-out already happened.
//!
//! The broker is optional. Publishing never blocks the caller: events go
//! onto a bounded queue drained by [`Bridge::run_publisher`], and are
//! dropped when the queue is full. Each broker call is bounded by a
//! timeout. An unreachable broker is logged once at `warn`, subsequent
//! failures at `debug`, and recovery at `info`. While degraded, events are
//! discarded without touching the broker until the backoff has elapsed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{ClientId, AWARENESS_REMOVED};
use crate::session::Retraction;

/// Pattern every subscriber listens on.
pub const SUBSCRIBE_PATTERN: &str = "doc:*";

/// Payloads at or above this size are LZ4-compressed on the wire.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Delay between subscription attempts while the broker is unreachable.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on a single publish or subscribe call.
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(2);

/// Events waiting for the publisher task before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Bridge errors. Never surfaced past the bridge itself.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("event encode failed: {0}")]
    Encode(String),
    #[error("event decode failed: {0}")]
    Decode(String),
}

// ─── Events ──────────────────────────────────────────────────────────

/// What a bridged event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Update,
    Awareness,
}

impl EventKind {
    fn suffix(self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Awareness => "awareness",
        }
    }
}

/// Channel name for a document and event kind: `doc:{key}:{kind}`.
pub fn channel_name(doc_key: &str, kind: EventKind) -> String {
    format!("doc:{doc_key}:{}", kind.suffix())
}

/// An event exchanged between server instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    /// Instance id of the publishing process
    pub origin: Uuid,
    pub doc_key: String,
    pub kind: EventKind,
    /// Client id on the publishing process
    pub sender: ClientId,
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    origin: Uuid,
    doc_key: String,
    kind: EventKind,
    sender: ClientId,
    compressed: bool,
    payload: Vec<u8>,
}

impl BridgeEvent {
    pub fn channel(&self) -> String {
        channel_name(&self.doc_key, self.kind)
    }

    /// Encode with bincode, compressing large payloads.
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        let compressed = self.payload.len() >= COMPRESSION_THRESHOLD;
        let payload = if compressed {
            lz4_flex::compress_prepend_size(&self.payload)
        } else {
            self.payload.clone()
        };
        let wire = WireEvent {
            origin: self.origin,
            doc_key: self.doc_key.clone(),
            kind: self.kind,
            sender: self.sender,
            compressed,
            payload,
        };
        bincode::serde::encode_to_vec(&wire, bincode::config::standard())
            .map_err(|e| BridgeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let (wire, _): (WireEvent, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| BridgeError::Decode(e.to_string()))?;
        let payload = if wire.compressed {
            lz4_flex::decompress_size_prepended(&wire.payload)
                .map_err(|e| BridgeError::Decode(e.to_string()))?
        } else {
            wire.payload
        };
        Ok(Self {
            origin: wire.origin,
            doc_key: wire.doc_key,
            kind: wire.kind,
            sender: wire.sender,
            payload,
        })
    }
}

// ─── Brokers ─────────────────────────────────────────────────────────

/// A message received from a broker subscription.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe transport between server instances.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Pattern-subscribe. The stream ends when the subscription is lost.
    async fn subscribe(&self, pattern: &str)
        -> Result<BoxStream<'static, BrokerMessage>, BridgeError>;
}

/// Redis pub/sub broker.
pub struct RedisBroker {
    client: redis::Client,
    /// Lazily established, auto-reconnecting publish connection
    publisher: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisBroker {
    /// Parse the URL. No connection is made until first use.
    pub fn open(url: &str) -> Result<Self, BridgeError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            publisher: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, BridgeError> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(DEFAULT_BROKER_TIMEOUT)
            .set_response_timeout(DEFAULT_BROKER_TIMEOUT);
        let conn = self.client.get_connection_manager_with_config(config).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError> {
        let mut pubsub = tokio::time::timeout(DEFAULT_BROKER_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| BridgeError::Timeout(DEFAULT_BROKER_TIMEOUT))??;
        pubsub.psubscribe(pattern).await?;
        let messages = pubsub.into_on_message().map(|msg| BrokerMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(messages.boxed())
    }
}

struct MemoryBrokerInner {
    sender: broadcast::Sender<BrokerMessage>,
    available: AtomicBool,
}

/// In-process broker for running several instances in one process.
///
/// `set_available(false)` simulates an outage: publish and subscribe fail
/// until it is switched back on.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(MemoryBrokerInner {
                sender,
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BridgeError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BridgeError::Unavailable("memory broker offline".into()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Glob match supporting a single trailing `*`.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.check()?;
        // No subscribers is not an error.
        let _ = self.inner.sender.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError> {
        self.check()?;
        let receiver = self.inner.sender.subscribe();
        let pattern = pattern.to_string();
        let messages = stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Memory broker subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg| std::future::ready(pattern_matches(&pattern, &msg.channel)));
        Ok(messages.boxed())
    }
}

// ─── Bridge ──────────────────────────────────────────────────────────

/// Receives events published by other instances.
pub trait RemoteSink: Send + Sync {
    fn apply_remote(&self, event: BridgeEvent);
}

/// Bridge statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub ignored: u64,
    /// Events discarded because the publish queue was full
    pub dropped: u64,
}

/// Publishes local events and feeds remote ones into a [`RemoteSink`].
pub struct Bridge {
    instance_id: Uuid,
    broker: Option<Arc<dyn Broker>>,
    /// Set while the broker is unreachable
    degraded: AtomicBool,
    /// No publish is attempted before this instant while degraded
    retry_at: Mutex<Option<Instant>>,
    reconnect_backoff: Duration,
    broker_timeout: Duration,
    queue: mpsc::Sender<BridgeEvent>,
    /// Receiving end, taken by the publisher task
    pending: Mutex<Option<mpsc::Receiver<BridgeEvent>>>,
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
}

impl Bridge {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::build(Some(broker))
    }

    /// Single-instance mode: publishing is a no-op.
    pub fn disabled() -> Self {
        Self::build(None)
    }

    fn build(broker: Option<Arc<dyn Broker>>) -> Self {
        let (queue, pending) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        Self {
            instance_id: Uuid::new_v4(),
            broker,
            degraded: AtomicBool::new(false),
            retry_at: Mutex::new(None),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            broker_timeout: DEFAULT_BROKER_TIMEOUT,
            queue,
            pending: Mutex::new(Some(pending)),
            published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Delay between resubscribe attempts, and how long publishing is
    /// suspended after a failure.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        let (queue, pending) = mpsc::channel(capacity.max(1));
        self.queue = queue;
        self.pending = Mutex::new(Some(pending));
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_enabled(&self) -> bool {
        self.broker.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Queue an update for other instances. Never waits.
    pub fn publish_update(&self, doc_key: &str, sender: ClientId, payload: &[u8]) {
        self.enqueue(EventKind::Update, doc_key, sender, payload);
    }

    /// Queue a presence change for other instances. Never waits.
    pub fn publish_awareness(&self, doc_key: &str, sender: ClientId, payload: &[u8]) {
        self.enqueue(EventKind::Awareness, doc_key, sender, payload);
    }

    fn enqueue(&self, kind: EventKind, doc_key: &str, sender: ClientId, payload: &[u8]) {
        if self.broker.is_none() {
            return;
        }
        let event = BridgeEvent {
            origin: self.instance_id,
            doc_key: doc_key.to_string(),
            kind,
            sender,
            payload: payload.to_vec(),
        };
        if self.queue.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed);
            if dropped == 0 {
                log::warn!("Bridge publish queue full, dropping events for other instances");
            }
        }
    }

    /// Publisher loop. Drains the queue until `shutdown`.
    ///
    /// Only one publisher may run per bridge; a second call returns at once.
    pub async fn run_publisher(&self, shutdown: CancellationToken) {
        let Some(broker) = self.broker.clone() else {
            return;
        };
        let Some(mut events) = self.pending.lock().take() else {
            log::warn!("Bridge publisher already running");
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                next = events.recv() => match next {
                    Some(event) => self.send(broker.as_ref(), event).await,
                    None => return,
                }
            }
        }
    }

    async fn send(&self, broker: &dyn Broker, event: BridgeEvent) {
        if self.suspended() {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let bytes = match event.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Dropping bridge event for {}: {e}", event.doc_key);
                return;
            }
        };
        let result = match tokio::time::timeout(
            self.broker_timeout,
            broker.publish(&event.channel(), bytes),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.broker_timeout)),
        };
        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                self.mark_healthy();
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                *self.retry_at.lock() = Some(Instant::now() + self.reconnect_backoff);
                self.mark_degraded(&e);
            }
        }
    }

    /// True while degraded and the backoff has not yet elapsed.
    fn suspended(&self) -> bool {
        if !self.is_degraded() {
            return false;
        }
        matches!(*self.retry_at.lock(), Some(at) if Instant::now() < at)
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            log::info!("Broker reachable again; cross-instance fan-out restored");
        }
    }

    fn mark_degraded(&self, error: &BridgeError) {
        if self.degraded.swap(true, Ordering::Relaxed) {
            log::debug!("Broker still unavailable: {error}");
        } else {
            log::warn!("Broker unavailable, continuing single-instance: {error}");
        }
    }

    /// Decode and route one broker message. Returns `true` if it was applied.
    pub fn deliver(&self, sink: &dyn RemoteSink, message: &BrokerMessage) -> bool {
        let event = match BridgeEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Malformed bridge event on {}: {e}", message.channel);
                self.ignored.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if event.origin == self.instance_id {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        log::trace!(
            "Remote {:?} for {} from {} (client {})",
            event.kind,
            event.doc_key,
            event.origin,
            event.sender
        );
        self.received.fetch_add(1, Ordering::Relaxed);
        sink.apply_remote(event);
        true
    }

    /// Subscriber loop. Resubscribes with a fixed backoff until `shutdown`.
    pub async fn run(&self, sink: Arc<dyn RemoteSink>, shutdown: CancellationToken) {
        let Some(broker) = self.broker.clone() else {
            return;
        };
        loop {
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = tokio::time::timeout(self.broker_timeout, broker.subscribe(SUBSCRIBE_PATTERN)) => {
                    result.unwrap_or(Err(BridgeError::Timeout(self.broker_timeout)))
                }
            };
            match subscription {
                Ok(mut messages) => {
                    log::info!("Bridge {} subscribed to {SUBSCRIBE_PATTERN}", self.instance_id);
                    self.mark_healthy();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = messages.next() => match next {
                                Some(message) => {
                                    self.deliver(sink.as_ref(), &message);
                                }
                                None => {
                                    log::warn!("Broker subscription lost");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => self.mark_degraded(&e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
            }
        }
    }

    /// Queue awareness retractions produced by local disconnects.
    pub async fn forward_retractions(
        &self,
        mut retractions: mpsc::UnboundedReceiver<Retraction>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                next = retractions.recv() => match next {
                    Some(r) => self.publish_awareness(&r.doc_key, r.client_id, AWARENESS_REMOVED),
                    None => return,
                }
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BridgeEvent>>);

    /// A broker that accepts calls and never answers them.
    #[derive(Default)]
    struct StalledBroker {
        publishes: AtomicU64,
    }

    #[async_trait]
    impl Broker for StalledBroker {
        async fn publish(&self, _channel: &str, _payload: Vec<u8>) -> Result<(), BridgeError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            _pattern: &str,
        ) -> Result<BoxStream<'static, BrokerMessage>, BridgeError> {
            std::future::pending().await
        }
    }

    fn spawn_publisher(
        bridge: &Arc<Bridge>,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { bridge.run_publisher(shutdown).await })
    }

    impl RemoteSink for Recorder {
        fn apply_remote(&self, event: BridgeEvent) {
            self.0.lock().push(event);
        }
    }

    fn event(origin: Uuid, payload: Vec<u8>) -> BridgeEvent {
        BridgeEvent {
            origin,
            doc_key: "doc-1".into(),
            kind: EventKind::Update,
            sender: 3,
            payload,
        }
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_name("doc-1", EventKind::Update), "doc:doc-1:update");
        assert_eq!(channel_name("doc-1", EventKind::Awareness), "doc:doc-1:awareness");
        assert!(pattern_matches(SUBSCRIBE_PATTERN, "doc:x:update"));
        assert!(!pattern_matches(SUBSCRIBE_PATTERN, "other:x"));
        assert!(pattern_matches("exact", "exact"));
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let payload = vec![7u8; 8 * COMPRESSION_THRESHOLD];
        let original = event(Uuid::new_v4(), payload);
        let bytes = original.encode().unwrap();
        assert!(bytes.len() < original.payload.len());
        assert_eq!(BridgeEvent::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BridgeEvent::decode(&[0xFF, 0x00]).is_err());
    }

    #[test]
    fn test_deliver_drops_own_events() {
        let bridge = Bridge::new(Arc::new(MemoryBroker::default()));
        let sink = Recorder::default();

        let own = BrokerMessage {
            channel: "doc:doc-1:update".into(),
            payload: event(bridge.instance_id(), vec![1]).encode().unwrap(),
        };
        let remote = BrokerMessage {
            channel: "doc:doc-1:update".into(),
            payload: event(Uuid::new_v4(), vec![2]).encode().unwrap(),
        };
        assert!(!bridge.deliver(&sink, &own));
        assert!(bridge.deliver(&sink, &remote));

        let seen = sink.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, vec![2]);
        assert_eq!(bridge.stats().ignored, 1);
        assert_eq!(bridge.stats().received, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_other_instance() {
        let broker = MemoryBroker::default();
        let a = Arc::new(Bridge::new(Arc::new(broker.clone())));
        let b = Bridge::new(Arc::new(broker.clone()));
        let mut messages = broker.subscribe(SUBSCRIBE_PATTERN).await.unwrap();
        let shutdown = CancellationToken::new();
        let publisher = spawn_publisher(&a, &shutdown);

        a.publish_update("doc-1", 4, &[9, 9]);
        let message = messages.next().await.unwrap();
        assert_eq!(message.channel, "doc:doc-1:update");

        let sink = Recorder::default();
        assert!(b.deliver(&sink, &message));
        assert!(!a.deliver(&sink, &message));
        {
            let seen = sink.0.lock();
            assert_eq!(seen[0].sender, 4);
            assert_eq!(seen[0].payload, vec![9, 9]);
        }

        shutdown.cancel();
        publisher.await.unwrap();
        assert_eq!(a.stats().published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_is_not_fatal() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        let bridge = Arc::new(
            Bridge::new(Arc::new(broker.clone())).with_reconnect_backoff(Duration::from_millis(100)),
        );
        let shutdown = CancellationToken::new();
        let _publisher = spawn_publisher(&bridge, &shutdown);

        bridge.publish_update("doc", 1, &[1]);
        bridge.publish_awareness("doc", 1, &[1]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.is_degraded());
        assert_eq!(bridge.stats().publish_failures, 2);

        broker.set_available(true);
        // Still inside the backoff: discarded without a broker call.
        bridge.publish_update("doc", 1, &[1]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bridge.is_degraded());
        assert_eq!(bridge.stats().publish_failures, 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.publish_update("doc", 1, &[1]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!bridge.is_degraded());
        assert_eq!(bridge.stats().published, 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_broker_never_blocks_publishers() {
        let broker = Arc::new(StalledBroker::default());
        let bridge = Arc::new(
            Bridge::new(broker.clone())
                .with_broker_timeout(Duration::from_millis(100))
                .with_reconnect_backoff(Duration::from_secs(5)),
        );
        let shutdown = CancellationToken::new();
        let publisher = spawn_publisher(&bridge, &shutdown);

        for i in 0..3u8 {
            bridge.publish_update("doc", 1, &[i]);
        }
        bridge.publish_awareness("doc", 1, &[7]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(bridge.is_degraded());
        assert_eq!(bridge.stats().publish_failures, 4);
        // One timed-out call, the rest failed fast.
        assert_eq!(broker.publishes.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        publisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscribe_is_retried() {
        let bridge = Arc::new(
            Bridge::new(Arc::new(StalledBroker::default()))
                .with_broker_timeout(Duration::from_millis(100))
                .with_reconnect_backoff(Duration::from_millis(100)),
        );
        let shutdown = CancellationToken::new();
        let task = {
            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bridge.run(Arc::new(Recorder::default()), shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(bridge.is_degraded());
        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_full_queue_drops_events() {
        let bridge = Bridge::new(Arc::new(MemoryBroker::default())).with_queue_capacity(2);
        for i in 0..5u8 {
            bridge.publish_update("doc", 1, &[i]);
        }
        assert_eq!(bridge.stats().dropped, 3);
    }

    #[tokio::test]
    async fn test_second_publisher_returns_immediately() {
        let bridge = Arc::new(Bridge::new(Arc::new(MemoryBroker::default())));
        let shutdown = CancellationToken::new();
        let first = spawn_publisher(&bridge, &shutdown);
        while bridge.pending.lock().is_some() {
            tokio::task::yield_now().await;
        }
        tokio::time::timeout(Duration::from_secs(1), bridge.run_publisher(shutdown.clone()))
            .await
            .unwrap();
        shutdown.cancel();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_bridge_is_noop() {
        let bridge = Bridge::disabled();
        assert!(!bridge.is_enabled());
        bridge.publish_update("doc", 1, &[1]);
        assert_eq!(bridge.stats(), BridgeStats::default());
        // Both loops return immediately without a broker.
        bridge
            .run(Arc::new(Recorder::default()), CancellationToken::new())
            .await;
        bridge.run_publisher(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_outage() {
        let broker = MemoryBroker::default();
        broker.set_available(false);
        let bridge = Arc::new(
            Bridge::new(Arc::new(broker.clone())).with_reconnect_backoff(Duration::from_millis(20)),
        );
        let sink = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();

        let task = {
            let bridge = bridge.clone();
            let sink: Arc<dyn RemoteSink> = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bridge.run(sink, shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bridge.is_degraded());
        broker.set_available(true);

        let publisher = Arc::new(Bridge::new(Arc::new(broker.clone())));
        let _publishing = spawn_publisher(&publisher, &shutdown);
        for _ in 0..50 {
            publisher.publish_update("doc", 2, &[5]);
            if !sink.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sink.0.lock().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_retractions_publishes_removal() {
        let broker = MemoryBroker::default();
        let bridge = Arc::new(Bridge::new(Arc::new(broker.clone())));
        let mut messages = broker.subscribe(SUBSCRIBE_PATTERN).await.unwrap();
        let shutdown = CancellationToken::new();
        let _publisher = spawn_publisher(&bridge, &shutdown);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Retraction { doc_key: "doc".into(), client_id: 8 }).unwrap();
        drop(tx);

        bridge.forward_retractions(rx, shutdown.clone()).await;

        let message = messages.next().await.unwrap();
        assert_eq!(message.channel, "doc:doc:awareness");
        let event = BridgeEvent::decode(&message.payload).unwrap();
        assert_eq!(event.sender, 8);
        assert_eq!(event.payload, AWARENESS_REMOVED);
    }
}
