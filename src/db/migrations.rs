// db/migrations.rs - Database schema migrations

use crate::Result;
use sqlx::SqlitePool;

/// Run all database migrations
///
/// Migrations are idempotent and safe to run multiple times.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run migrations in order
    run_if_needed(pool, 1, "create_records_table").await?;
    run_if_needed(pool, 2, "create_sync_queue_table").await?;
    run_if_needed(pool, 3, "create_kv_table").await?;
    run_if_needed(pool, 4, "create_indices").await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", id, name);

        match id {
            1 => create_records_table(pool).await?,
            2 => create_sync_queue_table(pool).await?,
            3 => create_kv_table(pool).await?,
            4 => create_indices(pool).await?,
            _ => {}
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Generic record table: one row per synced document, any collection
///
/// Domain fields live in the `data` JSON column; the remaining columns
/// are the sync metadata every synced collection carries.
async fn create_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            table_name TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            server_id TEXT,
            server_updated_at INTEGER,
            sync_status TEXT,
            last_sync_error TEXT,
            deleted_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (table_name, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_sync_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            operation TEXT NOT NULL CHECK(operation IN ('CREATE', 'UPDATE', 'DELETE')),
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Scratch key/value storage (watermark and friends)
async fn create_kv_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_indices(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(created_at, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_server_id ON records(table_name, server_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
