// db/mod.rs - Database module with SQLx integration

pub mod migrations;
pub mod store;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database abstraction with connection pooling
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create new database connection with migrations
    ///
    /// Uses WAL mode for better concurrency and sets pragmas for performance.
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            // Enable Write-Ahead Logging for better concurrency
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // Enable foreign key constraints
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        // Run migrations
        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (tests and throwaway engines)
    ///
    /// The pool is capped at one connection: each SQLite in-memory
    /// connection is its own database, so a larger pool would hand out
    /// empty databases.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};
