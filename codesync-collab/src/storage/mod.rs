//! Document store: titles and plain-text content by integer id.
//!
//! ```text
//! ┌──────────────────┐  load / save_content / insert  ┌──────────────────────┐
//! │  ControlChannel  │ ─────────────────────────────► │ dyn DocumentStore    │
//! └──────────────────┘                                │  ├─ RocksDocumentStore│
//!                                                     │  └─ MemoryDocumentStore│
//!                                                     └──────────────────────┘
//! ```
//!
//! The store only backs the control channel. CRDT update logs are never
//! persisted.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryDocumentStore;
pub use rocks::{RocksDocumentStore, StoreConfig};

/// Integer document id, as carried in numeric document keys.
pub type DocumentId = i64;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Document persistence used by the control channel.
pub trait DocumentStore: Send + Sync {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Replace the content of an existing document.
    fn save_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError>;

    /// Create a document and return its id. The language is detected from
    /// the title and content.
    fn insert(&self, title: &str, content: &str) -> Result<DocumentId, StoreError>;
}

/// Parse a document key as a store id. Non-numeric keys have no record.
pub fn document_id(doc_key: &str) -> Option<DocumentId> {
    doc_key.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id() {
        assert_eq!(document_id("42"), Some(42));
        assert_eq!(document_id("doc-1"), None);
        assert_eq!(document_id(""), None);
    }
}
