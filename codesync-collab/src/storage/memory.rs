//! In-memory document store.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{DocumentId, DocumentStore, StoreError, StoredDocument};
use crate::analysis::detect_language;

/// Volatile store used when no storage path is configured, and in tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.documents.read().get(&id).cloned())
    }

    fn save_content(&self, id: DocumentId, content: &str) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        document.content = content.to_string();
        Ok(())
    }

    fn insert(&self, title: &str, content: &str) -> Result<DocumentId, StoreError> {
        let mut documents = self.documents.write();
        let id = documents.keys().max().copied().unwrap_or(0) + 1;
        documents.insert(
            id,
            StoredDocument {
                id,
                title: title.to_string(),
                content: content.to_string(),
                language: detect_language(content, Some(title)).to_string(),
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_load_save() {
        let store = MemoryDocumentStore::new();
        let a = store.insert("main.py", "print(1)").unwrap();
        let b = store.insert("notes", "hello").unwrap();
        assert_eq!((a, b), (1, 2));

        let doc = store.load(a).unwrap().unwrap();
        assert_eq!(doc.title, "main.py");
        assert_eq!(doc.language, "python");

        store.save_content(a, "print(2)").unwrap();
        assert_eq!(store.load(a).unwrap().unwrap().content, "print(2)");
        assert_eq!(store.load(99).unwrap(), None);
        assert_eq!(store.save_content(99, "x"), Err(StoreError::NotFound(99)));
        assert_eq!(store.len(), 2);
    }
}
