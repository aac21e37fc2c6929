// sync/queue.rs - Durable queue of pending local mutations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::store::Fields;
use crate::{Error, Result};

/// Kind of mutation recorded in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

/// One pending (or dead) mutation
///
/// `payload` is the JSON snapshot of the record's domain fields taken at
/// enqueue time; `retry_count` only ever grows until the item is acked
/// and deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueItem {
    pub id: String,
    pub operation: QueueOperation,
    pub table_name: String,
    pub record_id: String,
    pub payload: String,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Parse the payload snapshot back into domain fields
    pub fn payload_fields(&self) -> Result<Fields> {
        match serde_json::from_str(&self.payload)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "queue item {} holds non-object payload: {}",
                self.id, other
            ))),
        }
    }
}

/// Durable FIFO-ish log of pending local mutations
///
/// Items live in the `sync_queue` table until the server definitively
/// acknowledges them. Items whose `retry_count` reached the configured
/// maximum are dead: excluded from `pending()` but retained for
/// inspection until purged or reset.
#[derive(Clone)]
pub struct SyncQueue {
    pool: SqlitePool,
}

impl SyncQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a mutation on its own connection
    pub async fn enqueue(
        &self,
        operation: QueueOperation,
        table: &str,
        record_id: &str,
        payload: &Fields,
    ) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_tx(&mut conn, operation, table, record_id, payload)
            .await
    }

    /// Enqueue a mutation inside a caller-owned transaction
    ///
    /// This is the variant behind enqueue atomicity: the queue row
    /// commits or rolls back together with the record write.
    pub async fn enqueue_tx(
        &self,
        conn: &mut SqliteConnection,
        operation: QueueOperation,
        table: &str,
        record_id: &str,
        payload: &Fields,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(&Value::Object(payload.clone()))?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO sync_queue
                (id, operation, table_name, record_id, payload,
                 retry_count, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(operation)
        .bind(table)
        .bind(record_id)
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        tracing::debug!(
            "Enqueued {:?} for {}/{} as queue item {}",
            operation,
            table,
            record_id,
            id
        );

        Ok(id)
    }

    /// Items still eligible for push, in insertion order
    pub async fn pending(&self, max_retries: u32) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT * FROM sync_queue
            WHERE retry_count < ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(max_retries as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Dead items: retried out, retained for operator attention
    pub async fn failed(&self, max_retries: u32) -> Result<Vec<QueueItem>> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT * FROM sync_queue
            WHERE retry_count >= ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(max_retries as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Total queue length (pending plus dead)
    ///
    /// Advisory only; a lookup failure reports an empty queue rather
    /// than propagating.
    pub async fn count_all(&self) -> i64 {
        let result: std::result::Result<(i64,), sqlx::Error> =
            sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
                .fetch_one(&self.pool)
                .await;

        match result {
            Ok((count,)) => count,
            Err(e) => {
                tracing::warn!("Failed to count sync queue: {}", e);
                0
            }
        }
    }

    /// Delete an item after the server acknowledged it
    pub async fn ack(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("queue item {}", id)));
        }

        tracing::debug!("Acked queue item {}", id);
        Ok(())
    }

    /// Record a failed push attempt against an item
    pub async fn bump(&self, id: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1,
                error_message = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("queue item {}", id)));
        }

        tracing::debug!("Bumped queue item {}: {}", id, error);
        Ok(())
    }

    /// Delete all dead items; returns how many were removed
    pub async fn purge_failed(&self, max_retries: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE retry_count >= ?")
            .bind(max_retries as i64)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!("Purged {} dead queue items", purged);
        }
        Ok(purged)
    }

    /// Delete every queue row
    pub async fn purge_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_queue")
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        tracing::info!("Purged {} queue items", purged);
        Ok(purged)
    }

    /// Reset dead items for another round of pushes; returns how many
    pub async fn retry_failed(&self, max_retries: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET retry_count = 0,
                error_message = NULL,
                updated_at = ?
            WHERE retry_count >= ?
            "#,
        )
        .bind(Utc::now())
        .bind(max_retries as i64)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            tracing::info!("Reset {} dead queue items for retry", reset);
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn queue() -> SyncQueue {
        let db = Database::in_memory().await.unwrap();
        SyncQueue::new(db.pool)
    }

    fn payload(title: &str) -> Fields {
        let mut map = Fields::new();
        map.insert("title".to_string(), json!(title));
        map
    }

    #[tokio::test]
    async fn test_enqueue_preserves_insertion_order() {
        let queue = queue().await;
        queue
            .enqueue(QueueOperation::Create, "posts", "p1", &payload("A"))
            .await
            .unwrap();
        queue
            .enqueue(QueueOperation::Update, "posts", "p2", &payload("B"))
            .await
            .unwrap();
        queue
            .enqueue(QueueOperation::Delete, "posts", "p3", &Fields::new())
            .await
            .unwrap();

        let pending = queue.pending(3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].record_id, "p1");
        assert_eq!(pending[1].record_id, "p2");
        assert_eq!(pending[2].record_id, "p3");
        assert_eq!(pending[0].operation, QueueOperation::Create);
        assert_eq!(pending[0].retry_count, 0);
        assert!(pending[0].error_message.is_none());
        assert_eq!(pending[0].payload_fields().unwrap()["title"], json!("A"));
    }

    #[tokio::test]
    async fn test_enqueue_tx_rolls_back_with_transaction() {
        let queue = queue().await;
        {
            let mut tx = queue.pool.begin().await.unwrap();
            queue
                .enqueue_tx(&mut tx, QueueOperation::Create, "posts", "p1", &payload("A"))
                .await
                .unwrap();
            // dropped without commit
        }
        assert_eq!(queue.count_all().await, 0);

        let mut tx = queue.pool.begin().await.unwrap();
        queue
            .enqueue_tx(&mut tx, QueueOperation::Create, "posts", "p1", &payload("A"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(queue.count_all().await, 1);
    }

    #[tokio::test]
    async fn test_bump_is_monotonic_and_dead_letters() {
        let queue = queue().await;
        let id = queue
            .enqueue(QueueOperation::Create, "posts", "p1", &payload("A"))
            .await
            .unwrap();

        queue.bump(&id, "first failure").await.unwrap();
        queue.bump(&id, "second failure").await.unwrap();

        let pending = queue.pending(3).await.unwrap();
        assert_eq!(pending[0].retry_count, 2);
        assert_eq!(pending[0].error_message.as_deref(), Some("second failure"));

        queue.bump(&id, "third failure").await.unwrap();

        // dead: excluded from pending, surfaced in failed
        assert!(queue.pending(3).await.unwrap().is_empty());
        let failed = queue.failed(3).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 3);

        // still counted
        assert_eq!(queue.count_all().await, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_item() {
        let queue = queue().await;
        let id = queue
            .enqueue(QueueOperation::Create, "posts", "p1", &payload("A"))
            .await
            .unwrap();

        queue.ack(&id).await.unwrap();
        assert_eq!(queue.count_all().await, 0);
    }

    #[tokio::test]
    async fn test_ack_and_bump_missing_item() {
        let queue = queue().await;
        assert!(matches!(queue.ack("ghost").await, Err(Error::NotFound(_))));
        assert!(matches!(
            queue.bump("ghost", "err").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_and_retry_failed() {
        let queue = queue().await;
        let dead = queue
            .enqueue(QueueOperation::Create, "posts", "p1", &payload("A"))
            .await
            .unwrap();
        queue
            .enqueue(QueueOperation::Update, "posts", "p2", &payload("B"))
            .await
            .unwrap();
        for _ in 0..3 {
            queue.bump(&dead, "nope").await.unwrap();
        }

        // reset brings the dead item back into pending
        assert_eq!(queue.retry_failed(3).await.unwrap(), 1);
        assert_eq!(queue.pending(3).await.unwrap().len(), 2);
        let revived = queue.pending(3).await.unwrap();
        assert_eq!(revived[0].retry_count, 0);
        assert!(revived[0].error_message.is_none());

        // kill it again and purge
        for _ in 0..3 {
            queue.bump(&dead, "still no").await.unwrap();
        }
        assert_eq!(queue.purge_failed(3).await.unwrap(), 1);
        assert_eq!(queue.count_all().await, 1);

        assert_eq!(queue.purge_all().await.unwrap(), 1);
        assert_eq!(queue.count_all().await, 0);
    }
}
