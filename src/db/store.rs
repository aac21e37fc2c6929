// db/store.rs - Local record store with sync metadata and soft deletes

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{Error, Result};

/// Domain fields of a record, keyed by snake_case column name
pub type Fields = Map<String, Value>;

/// Sync lifecycle of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RecordSyncStatus {
    Pending,
    Synced,
    Failed,
}

/// One row of the generic record table
///
/// Domain fields are serialized JSON in `data`; everything else is sync
/// metadata. Timestamps are milliseconds since epoch (`server_updated_at`
/// on the server clock, the rest on the local clock).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRecord {
    pub table_name: String,
    pub id: String,
    pub data: String,
    pub server_id: Option<String>,
    pub server_updated_at: Option<i64>,
    pub sync_status: Option<RecordSyncStatus>,
    pub last_sync_error: Option<String>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredRecord {
    /// Parse the domain fields out of the JSON column
    pub fn fields(&self) -> Result<Fields> {
        match serde_json::from_str(&self.data)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Serialization(format!(
                "record {}/{} holds non-object data: {}",
                self.table_name, self.id, other
            ))),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_json(fields: &Fields) -> Result<String> {
    serde_json::to_string(&Value::Object(fields.clone())).map_err(Error::from)
}

/// Transactional document store over the shared SQLite pool
///
/// All synced collections share one physical table; `table_name` scopes
/// every operation. Application-facing reads hide tombstones, the sync
/// core sees them.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new locally-authored record, `sync_status = pending`
    pub async fn insert_tx(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO records (table_name, id, data, sync_status, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(table)
        .bind(id)
        .bind(to_json(fields)?)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Fetch one record, tombstones included
    pub async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>> {
        let record = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM records WHERE table_name = ? AND id = ?",
        )
        .bind(table)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// List live records of a collection, insertion order
    pub async fn list(&self, table: &str) -> Result<Vec<StoredRecord>> {
        let records = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT * FROM records
            WHERE table_name = ? AND deleted_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Count live records of a collection
    pub async fn count(&self, table: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM records WHERE table_name = ? AND deleted_at IS NULL",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn find_by_server_id(
        &self,
        table: &str,
        server_id: &str,
    ) -> Result<Option<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.find_by_server_id_tx(&mut conn, table, server_id).await
    }

    pub async fn find_by_server_id_tx(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        server_id: &str,
    ) -> Result<Option<StoredRecord>> {
        let record = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM records WHERE table_name = ? AND server_id = ?",
        )
        .bind(table)
        .bind(server_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(record)
    }

    /// Merge domain fields into an existing record and mark it pending
    pub async fn update_fields_tx(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
        fields: &Fields,
    ) -> Result<Fields> {
        let current = sqlx::query_as::<_, StoredRecord>(
            "SELECT * FROM records WHERE table_name = ? AND id = ?",
        )
        .bind(table)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("record {}/{}", table, id)))?;

        let mut merged = current.fields()?;
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }

        sqlx::query(
            r#"
            UPDATE records
            SET data = ?, sync_status = 'pending', updated_at = ?
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(to_json(&merged)?)
        .bind(now_ms())
        .bind(table)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(merged)
    }

    /// Soft-delete a locally-authored record
    pub async fn mark_deleted_tx(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET deleted_at = ?, sync_status = 'pending', updated_at = ?
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(now_ms())
        .bind(now_ms())
        .bind(table)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("record {}/{}", table, id)));
        }

        Ok(())
    }

    /// Writeback after the server acknowledged a pushed operation
    ///
    /// A missing row is not an error: the record may have been locally
    /// deleted between enqueue and ack, and the server-side effect has
    /// already been applied.
    pub async fn apply_push_ack(
        &self,
        table: &str,
        record_id: &str,
        server_id: Option<&str>,
        server_updated_at: Option<i64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET server_id = COALESCE(?, server_id),
                server_updated_at = COALESCE(?, server_updated_at),
                sync_status = 'synced',
                last_sync_error = NULL
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(server_id)
        .bind(server_updated_at)
        .bind(table)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Push acknowledged for missing record {}/{}; skipping writeback",
                table,
                record_id
            );
        }

        Ok(())
    }

    /// Materialize a server-created record locally
    pub async fn insert_from_server(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        server_id: &str,
        fields: &Fields,
        server_updated_at: Option<i64>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();

        sqlx::query(
            r#"
            INSERT INTO records
                (table_name, id, data, server_id, server_updated_at,
                 sync_status, last_sync_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'synced', NULL, ?, ?)
            "#,
        )
        .bind(table)
        .bind(&id)
        .bind(to_json(fields)?)
        .bind(server_id)
        .bind(server_updated_at)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(id)
    }

    /// Overwrite a local record with the server's version
    pub async fn overwrite_from_server(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        id: &str,
        fields: &Fields,
        server_updated_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET data = ?,
                server_updated_at = COALESCE(?, server_updated_at),
                sync_status = 'synced',
                last_sync_error = NULL,
                updated_at = ?
            WHERE table_name = ? AND id = ?
            "#,
        )
        .bind(to_json(fields)?)
        .bind(server_updated_at)
        .bind(now_ms())
        .bind(table)
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Tombstone every local record carrying a server id
    ///
    /// Already-deleted rows are left untouched so re-delivered deletions
    /// stay idempotent. Absence is not an error.
    pub async fn mark_deleted_by_server_id(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        server_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET deleted_at = ?, updated_at = ?
            WHERE table_name = ? AND server_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now_ms())
        .bind(now_ms())
        .bind(table)
        .bind(server_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }
}
