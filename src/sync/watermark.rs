// sync/watermark.rs - Pull watermark over a string-keyed scratch store

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;

/// Well-known key holding the last successful pull timestamp
pub const LAST_SYNC_KEY: &str = "@offlineSync:lastSyncAt";

/// String-keyed blob storage for engine scratch values
///
/// Hosts can swap in platform storage; the engine ships a SQLite-backed
/// implementation and an in-memory one.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Scratch storage in the engine's own SQLite database
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// In-memory scratch storage (tests, ephemeral engines)
#[derive(Default)]
pub struct MemoryKeyValueStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Best-effort accessor for the pull watermark
///
/// A failed or unparsable read degrades to "never pulled"; a failed
/// write is logged and swallowed, costing at worst one redundant pull.
#[derive(Clone)]
pub struct WatermarkStore {
    inner: Arc<dyn KeyValueStore>,
}

impl WatermarkStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// Millisecond timestamp of the last successful pull, if any
    pub async fn last_pulled_at(&self) -> Option<i64> {
        match self.inner.get(LAST_SYNC_KEY).await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(ts) => Some(ts),
                Err(_) => {
                    tracing::warn!("Ignoring unparsable pull watermark: {:?}", raw);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read pull watermark: {}", e);
                None
            }
        }
    }

    /// Persist a new watermark; failures are logged, not propagated
    pub async fn set_last_pulled_at(&self, timestamp: i64) {
        if let Err(e) = self
            .inner
            .set(LAST_SYNC_KEY, &timestamp.to_string())
            .await
        {
            tracing::warn!("Failed to persist pull watermark {}: {}", timestamp, e);
        }
    }
}
