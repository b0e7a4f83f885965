//! Document store the task applier writes to.
//!
//! The store is a collaborator of the consumer: it only needs the three
//! operations below. [`sqlite::SqliteStore`] is the production backend and
//! [`memory::MemoryStore`] is used in tests and local development.

use std::{future::Future, pin::Pin};

use crate::{
    error::Error,
    task::{Document, DocumentId},
};

pub mod memory;
pub mod sqlite;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Persistence operations used by the task applier.
///
/// Implementations must make `update_by_id` and `delete_by_id` report how many
/// documents they touched instead of failing when the target is absent; the
/// applier treats zero as success.
pub trait TaskStore: Send + Sync + 'static {
    /// Inserts a new document and returns the identifier the store assigned.
    fn insert(&self, document: Document) -> StoreFuture<'_, DocumentId>;

    /// Sets every key of `fields` on the document with the given id.
    ///
    /// # Returns
    /// The number of matched documents (0 or 1)
    fn update_by_id(&self, id: DocumentId, fields: Document) -> StoreFuture<'_, u64>;

    /// Removes the document with the given id.
    ///
    /// # Returns
    /// The number of deleted documents (0 or 1)
    fn delete_by_id(&self, id: DocumentId) -> StoreFuture<'_, u64>;
}
