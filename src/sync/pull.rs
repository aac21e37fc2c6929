// sync/pull.rs - Fetch server changes since the watermark and apply them

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

use super::conflict::{ConflictContext, ConflictResolver, Resolution};
use super::transport::{PullRequest, SyncTransport};
use super::watermark::WatermarkStore;
use crate::db::store::{RecordSyncStatus, Store, StoredRecord};
use crate::{Error, Result};

/// Count reported by one pull run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSummary {
    pub pulled: usize,
}

/// Wire field names that never land in the local `data` column:
/// `id` becomes `server_id`, the timestamps live in sync metadata.
const SKIPPED_FIELDS: &[&str] = &["id", "created_at", "createdAt", "updated_at", "updatedAt"];

/// Convert one camelCase wire key to its snake_case column name
fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Extract the domain fields of a server record, keys mapped to snake_case
fn domain_fields(record: &Map<String, Value>) -> Map<String, Value> {
    record
        .iter()
        .filter(|(key, _)| !SKIPPED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (camel_to_snake(key), value.clone()))
        .collect()
}

fn server_updated_at(record: &Map<String, Value>) -> Option<i64> {
    record
        .get("updated_at")
        .or_else(|| record.get("updatedAt"))
        .and_then(Value::as_i64)
}

fn server_id(record: &Map<String, Value>) -> Result<&str> {
    record
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Serialization("server record without an id".to_string()))
}

/// Applies server-originated changes to the local store
///
/// One pull is one watermark read, one transport round trip, one local
/// write transaction over every table stanza, then a best-effort
/// watermark write. A bad record is logged and skipped; it does not
/// reject the batch.
pub struct PullPipeline {
    store: Store,
    transport: Arc<dyn SyncTransport>,
    watermark: WatermarkStore,
    resolver: ConflictResolver,
    tables: Vec<String>,
}

impl PullPipeline {
    pub fn new(
        store: Store,
        transport: Arc<dyn SyncTransport>,
        watermark: WatermarkStore,
        resolver: ConflictResolver,
        tables: Vec<String>,
    ) -> Self {
        Self {
            store,
            transport,
            watermark,
            resolver,
            tables,
        }
    }

    /// Pull changes since the last watermark and apply them locally
    pub async fn pull(&self) -> Result<PullSummary> {
        let since = self.watermark.last_pulled_at().await;
        let request = PullRequest {
            last_sync_at: since,
            tables: self.tables.clone(),
        };

        let response = self.transport.pull(&request).await?;

        let mut pulled = 0usize;
        let mut tx = self.store.pool().begin().await?;

        for table in &self.tables {
            let Some(changes) = response.changes.get(table) else {
                continue;
            };

            for record in &changes.created {
                match self.apply_created(&mut tx, table, record).await {
                    Ok(()) => pulled += 1,
                    Err(e) => tracing::warn!("Skipping created record in {}: {}", table, e),
                }
            }

            for record in &changes.updated {
                match self.apply_updated(&mut tx, table, record).await {
                    Ok(()) => pulled += 1,
                    Err(e) => tracing::warn!("Skipping updated record in {}: {}", table, e),
                }
            }

            for deleted_id in &changes.deleted {
                match self
                    .store
                    .mark_deleted_by_server_id(&mut tx, table, deleted_id)
                    .await
                {
                    Ok(_) => pulled += 1,
                    Err(e) => tracing::warn!("Skipping deletion in {}: {}", table, e),
                }
            }
        }

        tx.commit().await?;

        // losing this write only costs one redundant pull
        self.watermark.set_last_pulled_at(response.timestamp).await;

        tracing::info!("Pull finished: {} changes applied", pulled);
        Ok(PullSummary { pulled })
    }

    /// A "created" stanza entry; a known server id degrades to an update
    async fn apply_created(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        record: &Map<String, Value>,
    ) -> Result<()> {
        let server_id = server_id(record)?;
        let updated_at = server_updated_at(record);
        let fields = domain_fields(record);

        match self
            .store
            .find_by_server_id_tx(conn, table, server_id)
            .await?
        {
            Some(local) => {
                self.apply_to_local(conn, table, &local, &fields, updated_at)
                    .await
            }
            None => {
                self.store
                    .insert_from_server(conn, table, server_id, &fields, updated_at)
                    .await?;
                Ok(())
            }
        }
    }

    /// An "updated" stanza entry; an unknown server id degrades to a create
    async fn apply_updated(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        record: &Map<String, Value>,
    ) -> Result<()> {
        let server_id = server_id(record)?;
        let updated_at = server_updated_at(record);
        let fields = domain_fields(record);

        match self
            .store
            .find_by_server_id_tx(conn, table, server_id)
            .await?
        {
            Some(local) => {
                self.apply_to_local(conn, table, &local, &fields, updated_at)
                    .await
            }
            None => {
                self.store
                    .insert_from_server(conn, table, server_id, &fields, updated_at)
                    .await?;
                Ok(())
            }
        }
    }

    /// Overwrite a known local record, consulting the resolver on conflict
    ///
    /// Conflict means: the local side has unpushed edits AND the server
    /// version it last saw is older than the version arriving now.
    async fn apply_to_local(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        local: &StoredRecord,
        server_fields: &Map<String, Value>,
        updated_at: Option<i64>,
    ) -> Result<()> {
        let conflict = local.sync_status == Some(RecordSyncStatus::Pending)
            && local.server_updated_at.is_some()
            && matches!((updated_at, local.server_updated_at),
                (Some(server), Some(seen)) if server > seen);

        if !conflict {
            return self
                .store
                .overwrite_from_server(conn, table, &local.id, server_fields, updated_at)
                .await;
        }

        let context = ConflictContext {
            table_name: table.to_string(),
            record_id: local.id.clone(),
            local_data: local.fields()?,
            server_data: server_fields.clone(),
            local_updated_at: local.updated_at,
            server_updated_at: updated_at.unwrap_or_default(),
        };

        tracing::debug!(
            "Conflict on {}/{}: local seen {:?}, server at {:?}",
            table,
            local.id,
            local.server_updated_at,
            updated_at
        );

        match self.resolver.resolve(&context) {
            Resolution::KeepLocal => {
                tracing::debug!("Conflict on {}/{} kept local version", table, local.id);
                Ok(())
            }
            Resolution::KeepServer => {
                self.store
                    .overwrite_from_server(conn, table, &local.id, server_fields, updated_at)
                    .await
            }
            Resolution::Merged(merged) => {
                self.store
                    .overwrite_from_server(conn, table, &local.id, &merged, updated_at)
                    .await
            }
        }
    }
}
