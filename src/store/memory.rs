//! In-memory implementation of the document store.
//!
//! Primarily used for testing and local development.

use std::sync::Arc;

use crate::task::{Document, DocumentId};

use super::{StoreFuture, TaskStore};

#[derive(Clone, Default)]
/// Thread-safe in-memory store backed by a concurrent hash map.
pub struct MemoryStore {
    documents: Arc<papaya::HashMap<DocumentId, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DocumentId) -> Option<Document> {
        let guard = self.documents.guard();
        self.documents.get(&id, &guard).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryStore {
    fn insert(&self, document: Document) -> StoreFuture<'_, DocumentId> {
        Box::pin(async move {
            let id = DocumentId::generate();
            let guard = self.documents.guard();
            self.documents.insert(id, document, &guard);
            Ok(id)
        })
    }

    fn update_by_id(&self, id: DocumentId, fields: Document) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let guard = self.documents.guard();
            let Some(mut document) = self.documents.get(&id, &guard).cloned() else {
                return Ok(0);
            };

            document.extend(fields);
            self.documents.insert(id, document, &guard);

            Ok(1)
        })
    }

    fn delete_by_id(&self, id: DocumentId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let guard = self.documents.guard();
            Ok(self.documents.remove(&id, &guard).map_or(0, |_| 1))
        })
    }
}
