//! Decodes, validates and applies one task against the store.
//!
//! The applier never touches the broker. It reports what happened as an
//! [`Outcome`] and leaves the acknowledgement to the classifier.

use crate::{
    error::Error,
    store::TaskStore,
    task::{self, Task},
};

/// Result of one processing attempt.
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// The payload can never succeed; do not retry.
    PermanentError(Error),
    /// The store or processing failed; eligible for retry.
    TransientError(Error),
}

impl Outcome {
    fn from_error(error: Error) -> Self {
        if error.is_permanent() {
            Self::PermanentError(error)
        } else {
            Self::TransientError(error)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Success => None,
            Self::PermanentError(e) | Self::TransientError(e) => Some(e),
        }
    }
}

impl From<Result<(), Error>> for Outcome {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::from_error(e),
        }
    }
}

pub struct TaskApplier<S> {
    store: S,
}

impl<S: TaskStore> TaskApplier<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the full decode → validate → apply pipeline on a raw payload.
    pub async fn process(&self, body: &[u8]) -> Outcome {
        let task = match task::decode(body).and_then(|record| record.validate()) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload = %String::from_utf8_lossy(body),
                    "Rejecting malformed task"
                );
                return Outcome::PermanentError(e);
            }
        };

        self.apply(task).await
    }

    pub async fn apply(&self, task: Task) -> Outcome {
        let action = task.action();

        let result = match task {
            Task::Create { fields } => self.store.insert(fields).await.map(|id| {
                tracing::info!(%action, %id, "Created task");
            }),
            Task::Update { id, fields } if fields.is_empty() => {
                tracing::info!(%action, %id, "Nothing to update");
                Ok(())
            }
            Task::Update { id, fields } => {
                self.store.update_by_id(id, fields).await.map(|matched| {
                    if matched == 0 {
                        tracing::warn!(%action, %id, "No task matched update");
                    } else {
                        tracing::info!(%action, %id, "Updated task");
                    }
                })
            }
            Task::Delete { id } => self.store.delete_by_id(id).await.map(|deleted| {
                if deleted == 0 {
                    tracing::warn!(%action, %id, "No task matched delete");
                } else {
                    tracing::info!(%action, %id, "Deleted task");
                }
            }),
        };

        if let Err(e) = &result {
            tracing::error!(%action, error = %e, "Store operation failed");
        }

        Outcome::from(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;

    use crate::{
        store::{memory::MemoryStore, StoreFuture},
        task::{Document, DocumentId},
    };

    use super::*;

    /// Wraps a store, counting calls and optionally failing all of them.
    #[derive(Clone, Default)]
    struct CountingStore {
        inner: MemoryStore,
        calls: Arc<AtomicUsize>,
        down: bool,
    }

    impl CountingStore {
        fn down() -> Self {
            Self {
                down: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down {
                return Err(Error::internal(eyre::eyre!("connection refused")));
            }
            Ok(())
        }
    }

    impl TaskStore for CountingStore {
        fn insert(&self, document: Document) -> StoreFuture<'_, DocumentId> {
            Box::pin(async move {
                self.check()?;
                self.inner.insert(document).await
            })
        }

        fn update_by_id(&self, id: DocumentId, fields: Document) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.check()?;
                self.inner.update_by_id(id, fields).await
            })
        }

        fn delete_by_id(&self, id: DocumentId) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                self.check()?;
                self.inner.delete_by_id(id).await
            })
        }
    }

    async fn seeded() -> (TaskApplier<CountingStore>, DocumentId) {
        let store = CountingStore::default();
        let mut doc = Document::new();
        doc.insert("title".to_owned(), json!("buy milk"));
        let id = store.inner.insert(doc).await.unwrap();
        (TaskApplier::new(store), id)
    }

    #[tokio::test]
    async fn create_inserts_without_client_id() {
        let applier = TaskApplier::new(CountingStore::default());

        let outcome = applier
            .process(br#"{"action":"create","_id":"65f1c0de9a1b2c3d4e5f6a7b","name":"buy milk"}"#)
            .await;

        assert!(outcome.is_success());
        assert_eq!(applier.store().calls(), 1);
        assert_eq!(applier.store().inner.len(), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_never_reach_the_store() {
        let applier = TaskApplier::new(CountingStore::default());

        let bodies = [
            "not json",
            r#"[{"action":"create"}]"#,
            r#"{"name":"no action"}"#,
            r#"{"action":"archive"}"#,
            r#"{"action":"update","title":"x"}"#,
            r#"{"action":"delete"}"#,
            r#"{"action":"delete","_id":"nope"}"#,
        ];

        for body in bodies {
            let outcome = applier.process(body.as_bytes()).await;
            assert!(
                matches!(outcome, Outcome::PermanentError(_)),
                "{body} should be permanent, got {outcome:?}"
            );
        }

        assert_eq!(applier.store().calls(), 0);
    }

    #[tokio::test]
    async fn empty_update_is_a_noop() {
        let applier = TaskApplier::new(CountingStore::down());

        let outcome = applier
            .process(br#"{"action":"update","_id":"65f1c0de9a1b2c3d4e5f6a7b"}"#)
            .await;

        assert!(outcome.is_success());
        assert_eq!(applier.store().calls(), 0);
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let (applier, id) = seeded().await;
        let body = json!({"action": "update", "_id": id, "status": "completed"}).to_string();

        assert!(applier.process(body.as_bytes()).await.is_success());
        assert!(applier.process(body.as_bytes()).await.is_success());

        let doc = applier.store().inner.get(id).unwrap();
        assert_eq!(doc["status"], json!("completed"));
        assert_eq!(doc["title"], json!("buy milk"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (applier, id) = seeded().await;
        let body = json!({"action": "delete", "_id": id}).to_string();

        assert!(applier.process(body.as_bytes()).await.is_success());
        assert!(applier.store().inner.is_empty());
        assert!(applier.process(body.as_bytes()).await.is_success());
        assert_eq!(applier.store().calls(), 2);
    }

    #[tokio::test]
    async fn missing_targets_still_succeed() {
        let applier = TaskApplier::new(CountingStore::default());
        let id = DocumentId::generate();

        let update = json!({"action": "update", "_id": id, "status": "x"}).to_string();
        let delete = json!({"action": "delete", "_id": id}).to_string();

        assert!(applier.process(update.as_bytes()).await.is_success());
        assert!(applier.process(delete.as_bytes()).await.is_success());
    }

    #[tokio::test]
    async fn store_failures_are_transient() {
        let applier = TaskApplier::new(CountingStore::down());
        let id = DocumentId::generate();

        for body in [
            json!({"action": "create", "name": "buy milk"}),
            json!({"action": "update", "_id": id, "status": "x"}),
            json!({"action": "delete", "_id": id}),
        ] {
            let outcome = applier.process(body.to_string().as_bytes()).await;
            assert!(matches!(outcome, Outcome::TransientError(_)));
        }

        assert_eq!(applier.store().calls(), 3);
    }
}
