// sync/push.rs - Drain the queue toward the server in batches

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::queue::{QueueItem, SyncQueue};
use super::retry::RetryPolicy;
use super::transport::{PushChange, PushRequest, SyncTransport};
use crate::db::store::Store;
use crate::Result;

/// Counts reported by one push run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub pushed: usize,
    pub failed: usize,
}

/// Sends pending queue items to the server and applies acknowledgements
///
/// A transport-level failure (or a response with `success = false`)
/// bumps every item in the batch; a per-item error bumps only that
/// item. Acked items are deleted from the queue after the local
/// writeback.
pub struct PushPipeline {
    queue: SyncQueue,
    store: Store,
    transport: Arc<dyn SyncTransport>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl PushPipeline {
    pub fn new(
        queue: SyncQueue,
        store: Store,
        transport: Arc<dyn SyncTransport>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            store,
            transport,
            retry,
            batch_size,
        }
    }

    /// Push everything currently pending, in insertion order
    pub async fn push(&self) -> Result<PushSummary> {
        let items = self.queue.pending(self.retry.max_retries).await?;
        if items.is_empty() {
            return Ok(PushSummary::default());
        }

        tracing::info!("Pushing {} queued mutations", items.len());

        let mut summary = PushSummary::default();
        for batch in items.chunks(self.batch_size) {
            self.push_batch(batch, &mut summary).await?;
        }

        tracing::info!(
            "Push finished: {} acknowledged, {} failed",
            summary.pushed,
            summary.failed
        );

        Ok(summary)
    }

    async fn push_batch(&self, batch: &[QueueItem], summary: &mut PushSummary) -> Result<()> {
        // Items whose stored payload no longer parses cannot be sent;
        // bump them so they eventually dead-letter.
        let mut sendable: Vec<&QueueItem> = Vec::with_capacity(batch.len());
        let mut changes: Vec<PushChange> = Vec::with_capacity(batch.len());

        for item in batch {
            match item.payload_fields() {
                Ok(data) => {
                    changes.push(PushChange {
                        table_name: item.table_name.clone(),
                        operation: item.operation,
                        record_id: item.record_id.clone(),
                        data,
                    });
                    sendable.push(item);
                }
                Err(e) => {
                    tracing::warn!("Queue item {} has unreadable payload: {}", item.id, e);
                    self.queue.bump(&item.id, &e.to_string()).await?;
                    summary.failed += 1;
                }
            }
        }

        if changes.is_empty() {
            return Ok(());
        }

        let request = PushRequest { changes };
        let response = match self.transport.push(&request).await {
            Ok(response) if response.success => response,
            Ok(_) => {
                self.fail_batch(&sendable, "push batch rejected by server", summary)
                    .await;
                return Ok(());
            }
            Err(e) => {
                self.fail_batch(&sendable, &e.to_string(), summary).await;
                return Ok(());
            }
        };

        for (index, item) in sendable.iter().enumerate() {
            match response.results.get(index) {
                Some(result) => {
                    if let Some(error) = &result.error {
                        tracing::debug!("Server rejected queue item {}: {}", item.id, error);
                        self.queue.bump(&item.id, error).await?;
                        if self.retry.is_exhausted(item.retry_count + 1) {
                            tracing::warn!(
                                "Queue item {} dead-lettered after {} attempts",
                                item.id,
                                item.retry_count + 1
                            );
                        }
                        summary.failed += 1;
                    } else {
                        self.store
                            .apply_push_ack(
                                &item.table_name,
                                &item.record_id,
                                result.server_id.as_deref(),
                                result.server_updated_at,
                            )
                            .await?;
                        self.queue.ack(&item.id).await?;
                        summary.pushed += 1;
                    }
                }
                None => {
                    // response shorter than the batch; do not trust the zip
                    self.queue.bump(&item.id, "missing result for item").await?;
                    summary.failed += 1;
                }
            }
        }

        Ok(())
    }

    /// Bump every item of a batch that failed wholesale
    ///
    /// A bump failure here is logged and skipped: the item keeps its old
    /// retry count and is re-sent next push (at-least-once).
    async fn fail_batch(&self, items: &[&QueueItem], error: &str, summary: &mut PushSummary) {
        tracing::warn!("Push batch of {} failed: {}", items.len(), error);

        for item in items {
            if let Err(e) = self.queue.bump(&item.id, error).await {
                tracing::error!("Failed to record push failure on {}: {}", item.id, e);
            } else if self.retry.is_exhausted(item.retry_count + 1) {
                tracing::warn!(
                    "Queue item {} dead-lettered after {} attempts",
                    item.id,
                    item.retry_count + 1
                );
            }
            summary.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::{Fields, RecordSyncStatus};
    use crate::db::Database;
    use crate::sync::queue::QueueOperation;
    use crate::sync::testing::MockTransport;
    use crate::sync::transport::{PushResponse, PushResult};
    use crate::Error;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        queue: SyncQueue,
        store: Store,
        transport: Arc<MockTransport>,
        pipeline: PushPipeline,
    }

    async fn fixture() -> Fixture {
        fixture_with(RetryPolicy::default(), 50).await
    }

    async fn fixture_with(retry: RetryPolicy, batch_size: usize) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let queue = SyncQueue::new(db.pool.clone());
        let store = Store::new(db.pool.clone());
        let transport = MockTransport::new();
        let pipeline = PushPipeline::new(
            queue.clone(),
            store.clone(),
            Arc::clone(&transport) as Arc<dyn SyncTransport>,
            retry,
            batch_size,
        );
        Fixture {
            queue,
            store,
            transport,
            pipeline,
        }
    }

    fn fields(title: &str) -> Fields {
        let mut map = Fields::new();
        map.insert("title".to_string(), json!(title));
        map
    }

    async fn seed_record(fixture: &Fixture, id: &str, title: &str) {
        let mut tx = fixture.store.pool().begin().await.unwrap();
        fixture
            .store
            .insert_tx(&mut tx, "posts", id, &fields(title))
            .await
            .unwrap();
        fixture
            .queue
            .enqueue_tx(&mut tx, QueueOperation::Create, "posts", id, &fields(title))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue_pushes_nothing() {
        let fixture = fixture().await;
        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary::default());
        assert_eq!(fixture.transport.push_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_push_acks_and_writes_back() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 1, failed: 0 });

        // queue drained, record marked synced with the server identity
        assert_eq!(fixture.queue.count_all().await, 0);
        let record = fixture.store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(record.server_id.as_deref(), Some("srv-p1"));
        assert_eq!(record.server_updated_at, Some(1000));
        assert_eq!(record.sync_status, Some(RecordSyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_partial_failure_splits_counts() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;
        seed_record(&fixture, "p2", "B").await;

        fixture.transport.queue_push(Ok(PushResponse {
            success: true,
            results: vec![
                PushResult {
                    record_id: Some("p1".to_string()),
                    server_id: Some("s1".to_string()),
                    server_updated_at: Some(200),
                    error: None,
                },
                PushResult {
                    record_id: Some("p2".to_string()),
                    error: Some("validation".to_string()),
                    ..Default::default()
                },
            ],
        }));

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 1, failed: 1 });

        let record = fixture.store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(record.server_id.as_deref(), Some("s1"));
        assert_eq!(record.sync_status, Some(RecordSyncStatus::Synced));

        let remaining = fixture.queue.pending(3).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record_id, "p2");
        assert_eq!(remaining[0].retry_count, 1);
        assert_eq!(remaining[0].error_message.as_deref(), Some("validation"));
    }

    #[tokio::test]
    async fn test_transport_failure_bumps_whole_batch_to_dead() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;

        // two prior failures, the transport error is the third strike
        let id = fixture.queue.pending(3).await.unwrap()[0].id.clone();
        fixture.queue.bump(&id, "earlier").await.unwrap();
        fixture.queue.bump(&id, "earlier").await.unwrap();

        fixture
            .transport
            .queue_push(Err(Error::Network("Network error".to_string())));

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 0, failed: 1 });

        assert!(fixture.queue.pending(3).await.unwrap().is_empty());
        let dead = fixture.queue.failed(3).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 3);
        assert!(dead[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("Network error"));
    }

    #[tokio::test]
    async fn test_rejected_batch_bumps_every_item() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;
        seed_record(&fixture, "p2", "B").await;

        fixture.transport.queue_push(Ok(PushResponse {
            success: false,
            results: vec![],
        }));

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 0, failed: 2 });

        for item in fixture.queue.pending(3).await.unwrap() {
            assert_eq!(item.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size_and_order() {
        let fixture = fixture_with(RetryPolicy::default(), 2).await;
        for id in ["p1", "p2", "p3", "p4", "p5"] {
            seed_record(&fixture, id, id).await;
        }

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 5, failed: 0 });

        let requests = fixture.transport.push_requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].changes.len(), 2);
        assert_eq!(requests[0].changes[0].record_id, "p1");
        assert_eq!(requests[1].changes[0].record_id, "p3");
        assert_eq!(requests[2].changes.len(), 1);
        assert_eq!(requests[2].changes[0].record_id, "p5");
    }

    #[tokio::test]
    async fn test_ack_for_locally_deleted_record_still_drains_queue() {
        let fixture = fixture().await;
        // queue item without a backing record (record deleted after enqueue)
        fixture
            .queue
            .enqueue(QueueOperation::Update, "posts", "ghost", &fields("gone"))
            .await
            .unwrap();

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 1, failed: 0 });
        assert_eq!(fixture.queue.count_all().await, 0);
    }

    #[tokio::test]
    async fn test_short_result_array_fails_unmatched_tail() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;
        seed_record(&fixture, "p2", "B").await;

        fixture.transport.queue_push(Ok(PushResponse {
            success: true,
            results: vec![PushResult {
                record_id: Some("p1".to_string()),
                server_id: Some("s1".to_string()),
                ..Default::default()
            }],
        }));

        let summary = fixture.pipeline.push().await.unwrap();
        assert_eq!(summary, PushSummary { pushed: 1, failed: 1 });

        let remaining = fixture.queue.pending(3).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].error_message.as_deref(),
            Some("missing result for item")
        );
    }

    #[tokio::test]
    async fn test_replay_after_spurious_ack_is_idempotent() {
        let fixture = fixture().await;
        seed_record(&fixture, "p1", "A").await;

        // first push acknowledged and applied
        fixture.pipeline.push().await.unwrap();
        let first = fixture.store.get("posts", "p1").await.unwrap().unwrap();

        // the same mutation re-queued (crash before ack persisted, say)
        fixture
            .queue
            .enqueue(QueueOperation::Create, "posts", "p1", &fields("A"))
            .await
            .unwrap();
        fixture.transport.queue_push(Ok(PushResponse {
            success: true,
            results: vec![PushResult {
                record_id: Some("p1".to_string()),
                server_id: Some("srv-p1".to_string()),
                server_updated_at: Some(1000),
                error: None,
            }],
        }));
        fixture.pipeline.push().await.unwrap();

        // no additional local mutation beyond the identical writeback
        let second = fixture.store.get("posts", "p1").await.unwrap().unwrap();
        assert_eq!(second.server_id, first.server_id);
        assert_eq!(second.server_updated_at, first.server_updated_at);
        assert_eq!(second.data, first.data);
        assert_eq!(fixture.queue.count_all().await, 0);
    }
}
