//! Document registry: per-document state keyed by document key.
//!
//! ```text
//! DocumentRegistry
//!   ├── "doc-1" ── Document { UpdateLog, AwarenessTable, members }
//!   ├── "doc-2" ── Document { … }
//!   └── …
//! ```
//!
//! The registry is the single owner of every per-document map. Sessions
//! refer to their document by key only.
//!
//! Lifecycle: a document is created on first reference. When its last
//! member leaves, an eviction timer is armed for the idle grace window.
//! Timers are never cancelled on rejoin; instead the timer re-validates at
//! fire time and only deletes a document that is still empty and has not
//! been emptied again since the timer was armed.
//!
//! Lock order: registry map → document state. No lock is held across an
//! `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::awareness::AwarenessTable;
use crate::protocol::ClientId;
use crate::update_log::UpdateLog;

/// Default idle grace period before an empty document is dropped.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(300);

/// Mutable state of one document. Guarded by [`Document::lock`].
#[derive(Debug, Default)]
pub struct DocumentState {
    pub updates: UpdateLog,
    pub awareness: AwarenessTable,
    pub members: HashSet<ClientId>,
    /// Bumped every time the document becomes empty.
    eviction_epoch: u64,
}

/// A document tracked by the registry.
#[derive(Debug)]
pub struct Document {
    key: String,
    state: Mutex<DocumentState>,
}

impl Document {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(DocumentState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock the document state for a synchronous mutation.
    pub fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock()
    }

    pub fn encoded_state(&self) -> Vec<u8> {
        self.state.lock().updates.encoded_state()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

/// Outcome of removing a member from its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// The member had awareness state, which has been deleted.
    pub awareness_removed: bool,
    /// Members left on the document.
    pub remaining: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub documents: usize,
    pub clients: usize,
    pub updates: usize,
}

struct RegistryInner {
    documents: RwLock<HashMap<String, Arc<Document>>>,
    idle_grace: Duration,
    shutdown: CancellationToken,
}

/// Creates, looks up and evicts documents. Cheap to clone.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                documents: RwLock::new(HashMap::new()),
                idle_grace,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_IDLE_GRACE)
    }

    pub fn idle_grace(&self) -> Duration {
        self.inner.idle_grace
    }

    /// Get or create the document for `key`. Idempotent.
    ///
    /// Concurrent first references observe the same `Document`.
    pub fn get_or_create(&self, key: &str) -> Arc<Document> {
        // Fast path: read lock
        if let Some(doc) = self.inner.documents.read().get(key) {
            return doc.clone();
        }

        // Slow path: double-check under the write lock
        let mut documents = self.inner.documents.write();
        documents
            .entry(key.to_string())
            .or_insert_with(|| {
                log::info!("Created document {key}");
                Arc::new(Document::new(key))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Document>> {
        self.inner.documents.read().get(key).cloned()
    }

    /// Attach a member, creating the document if needed.
    ///
    /// Runs under the registry map lock so an eviction can never detach the
    /// document between lookup and insertion.
    pub fn join(&self, key: &str, client_id: ClientId) -> Arc<Document> {
        {
            let documents = self.inner.documents.read();
            if let Some(doc) = documents.get(key) {
                doc.lock().members.insert(client_id);
                return doc.clone();
            }
        }

        let mut documents = self.inner.documents.write();
        let doc = documents
            .entry(key.to_string())
            .or_insert_with(|| {
                log::info!("Created document {key}");
                Arc::new(Document::new(key))
            })
            .clone();
        doc.lock().members.insert(client_id);
        doc
    }

    /// Detach a member and drop its awareness state.
    ///
    /// Arms the idle eviction timer when the document becomes empty.
    /// Returns `None` if the document is unknown.
    pub fn leave(&self, key: &str, client_id: ClientId) -> Option<Departure> {
        let doc = self.get(key)?;
        let (departure, epoch) = {
            let mut state = doc.lock();
            state.members.remove(&client_id);
            let awareness_removed = state.awareness.remove(client_id).is_some();
            let remaining = state.members.len();
            let epoch = if remaining == 0 {
                state.eviction_epoch += 1;
                Some(state.eviction_epoch)
            } else {
                None
            };
            (Departure { awareness_removed, remaining }, epoch)
        };

        if let Some(epoch) = epoch {
            self.schedule_eviction(&doc, epoch);
        }
        Some(departure)
    }

    /// Remove `key` if it has no members. Best-effort.
    pub fn remove(&self, key: &str) -> bool {
        let mut documents = self.inner.documents.write();
        let empty = documents
            .get(key)
            .is_some_and(|doc| doc.lock().members.is_empty());
        if empty {
            documents.remove(key);
            log::info!("Removed document {key}");
        }
        empty
    }

    fn schedule_eviction(&self, doc: &Arc<Document>, epoch: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime; idle eviction for {} not scheduled", doc.key());
            return;
        };

        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let target: Weak<Document> = Arc::downgrade(doc);
        let grace = self.inner.idle_grace;
        let shutdown = self.inner.shutdown.clone();
        let key = doc.key().to_string();

        log::debug!("Document {key} is empty; eviction in {grace:?}");
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            if let Some(inner) = registry.upgrade() {
                inner.evict_if_idle(&key, &target, epoch);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.documents.read().is_empty()
    }

    pub fn document_keys(&self) -> Vec<String> {
        self.inner.documents.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let documents = self.inner.documents.read();
        let mut stats = RegistryStats {
            documents: documents.len(),
            ..RegistryStats::default()
        };
        for doc in documents.values() {
            let state = doc.lock();
            stats.clients += state.members.len();
            stats.updates += state.updates.count();
        }
        stats
    }

    /// Stop every pending eviction timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RegistryInner {
    /// Check-then-delete under the map lock.
    fn evict_if_idle(&self, key: &str, target: &Weak<Document>, epoch: u64) {
        let mut documents = self.documents.write();
        let Some(doc) = documents.get(key) else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(doc), target.as_ptr()) {
            return;
        }
        let idle = {
            let state = doc.lock();
            state.members.is_empty() && state.eviction_epoch == epoch
        };
        if idle {
            documents.remove(key);
            log::info!("Evicted idle document {key}");
        }
    }
}
