//! SQLite-backed document store.
//!
//! Each task is one row: the id, the JSON document and millisecond
//! timestamps for creation and the last update.

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    SqlitePool,
};

use crate::{
    config::Config,
    error::Error,
    task::{Document, DocumentId},
};

use super::{StoreFuture, TaskStore};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the database named by the config and runs pending migrations.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = if config.db_path().is_some() {
            SqlitePoolOptions::new()
        } else {
            // Every connection to `:memory:` is a separate database, so keep
            // exactly one alive for the lifetime of the pool.
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        }
        .connect_with(opts)
        .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(path = config.db_path().unwrap_or(":memory:"), "Store ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Loads a stored document, if present.
    pub async fn get(&self, id: DocumentId) -> Result<Option<Document>, Error> {
        let document: Option<Json<Document>> =
            sqlx::query_scalar("SELECT document FROM tasks WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(document.map(|Json(doc)| doc))
    }

    pub async fn count(&self) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TaskStore for SqliteStore {
    fn insert(&self, document: Document) -> StoreFuture<'_, DocumentId> {
        Box::pin(async move {
            let id = DocumentId::generate();
            let now = chrono::Utc::now().timestamp_millis();

            sqlx::query(
                "
                INSERT INTO tasks (id, document, created_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ",
            )
            .bind(id.to_string())
            .bind(Json(&document))
            .bind(now)
            .execute(&self.pool)
            .await?;

            Ok(id)
        })
    }

    fn update_by_id(&self, id: DocumentId, fields: Document) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let current: Option<Json<Document>> =
                sqlx::query_scalar("SELECT document FROM tasks WHERE id = $1")
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;

            let Some(Json(mut document)) = current else {
                tx.commit().await?;
                return Ok(0);
            };

            document.extend(fields);

            sqlx::query(
                "
                UPDATE tasks
                SET document = $1, updated_at = $2
                WHERE id = $3
                ",
            )
            .bind(Json(&document))
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(1)
        })
    }

    fn delete_by_id(&self, id: DocumentId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;

            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect(&Config {
            db_path: Some(":memory:".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = memory_store().await;

        let id = store
            .insert(doc(json!({"title": "buy milk", "status": "pending"})))
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored["title"], json!("buy milk"));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = memory_store().await;
        let id = store
            .insert(doc(json!({"title": "buy milk", "status": "pending"})))
            .await
            .unwrap();

        let matched = store
            .update_by_id(id, doc(json!({"status": "completed", "priority": 2})))
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored["title"], json!("buy milk"));
        assert_eq!(stored["status"], json!("completed"));
        assert_eq!(stored["priority"], json!(2));
    }

    #[tokio::test]
    async fn missing_targets_match_nothing() {
        let store = memory_store().await;
        let id = DocumentId::generate();

        assert_eq!(
            store
                .update_by_id(id, doc(json!({"status": "completed"})))
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.delete_by_id(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_once() {
        let store = memory_store().await;
        let id = store.insert(doc(json!({"title": "x"}))).await.unwrap();

        assert_eq!(store.delete_by_id(id).await.unwrap(), 1);
        assert_eq!(store.delete_by_id(id).await.unwrap(), 0);
        assert!(store.get(id).await.unwrap().is_none());
    }
}
