// sync/engine.rs - Orchestrates push and pull behind a single state machine

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::conflict::ConflictResolver;
use super::network::{ConnectivitySource, NetworkMonitor, SubscriptionId};
use super::pull::PullPipeline;
use super::push::PushPipeline;
use super::queue::{QueueItem, QueueOperation, SyncQueue};
use super::retry::RetryPolicy;
use super::transport::SyncTransport;
use super::watermark::{KeyValueStore, WatermarkStore};
use crate::config::SyncConfig;
use crate::db::store::{Fields, Store};
use crate::db::Database;
use crate::state::SyncState;
use crate::{Error, Result};

/// Counters for one sync attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pushed: usize,
    pub pulled: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// What a call to [`SyncEngine::sync`] hands back
///
/// Failures inside an attempt are captured here; `sync` itself never
/// returns `Err`.
#[derive(Debug, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub stats: SyncStats,
    pub error: Option<Error>,
}

impl SyncOutcome {
    fn failure(error: Error, duration_ms: u64) -> Self {
        Self {
            success: false,
            stats: SyncStats {
                duration_ms,
                ..Default::default()
            },
            error: Some(error),
        }
    }
}

pub type StateListener = Box<dyn Fn(&SyncState) + Send + Sync>;

/// Identifier handed back by [`SyncEngine::subscribe`]
pub type ObserverId = u64;

struct EngineInner {
    config: SyncConfig,
    store: Store,
    queue: SyncQueue,
    push: PushPipeline,
    pull: PullPipeline,
    monitor: Arc<NetworkMonitor>,
    state: RwLock<SyncState>,
    /// Single-flight guard: only one sync attempt may be in flight
    is_syncing: AtomicBool,
    listeners: Mutex<HashMap<ObserverId, StateListener>>,
    next_listener_id: AtomicU64,
    ticker_stop: Mutex<Option<watch::Sender<bool>>>,
    ticker_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_subscription: Mutex<Option<SubscriptionId>>,
}

/// The sync engine: owns the queue, both pipelines, the network
/// monitor, and the observable engine state
///
/// Cheaply cloneable; all clones share one engine. Sync-level
/// operations are serialized behind the single-flight guard, so push
/// and pull never overlap and a second concurrent `sync()` fails fast
/// with [`Error::SyncInProgress`].
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl SyncEngine {
    /// Build an engine over an opened database and the platform
    /// collaborators (transport, connectivity probe, scratch storage)
    pub fn new(
        db: &Database,
        transport: Arc<dyn SyncTransport>,
        connectivity: Arc<dyn ConnectivitySource>,
        scratch: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let resolver = ConflictResolver::new(
            config.conflict_strategy,
            config.custom_conflict_resolver.clone(),
        )?;
        let retry = RetryPolicy::new(config.max_retries, config.retry_delay_base);

        let store = Store::new(db.pool.clone());
        let queue = SyncQueue::new(db.pool.clone());
        let push = PushPipeline::new(
            queue.clone(),
            store.clone(),
            Arc::clone(&transport),
            retry,
            config.push_batch_size,
        );
        let pull = PullPipeline::new(
            store.clone(),
            transport,
            WatermarkStore::new(scratch),
            resolver,
            config.tables.clone(),
        );
        let monitor = Arc::new(NetworkMonitor::new(connectivity));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                queue,
                push,
                pull,
                monitor,
                state: RwLock::new(SyncState::default()),
                is_syncing: AtomicBool::new(false),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                ticker_stop: Mutex::new(None),
                ticker_task: Mutex::new(None),
                reconnect_subscription: Mutex::new(None),
            }),
        })
    }

    /// Start the network monitor, the background ticker, and the
    /// reconnect trigger (per configuration)
    pub async fn initialize(&self) {
        self.inner.monitor.initialize().await;
        self.refresh_pending().await;

        if self.inner.config.enable_background_sync {
            self.start_ticker();
        }
        if self.inner.config.sync_on_reconnect {
            self.attach_reconnect();
        }

        tracing::info!(
            "Sync engine initialized (background={}, on_reconnect={})",
            self.inner.config.enable_background_sync,
            self.inner.config.sync_on_reconnect
        );
    }

    /// Stop the ticker and the reconnect trigger
    ///
    /// An in-flight sync is not interrupted; it finishes on its own
    /// terms before the ticker task winds down.
    pub async fn shutdown(&self) {
        if let Some(stop) = self.inner.ticker_stop.lock().unwrap().take() {
            let _ = stop.send(true);
        }
        let handle = self.inner.ticker_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Some(id) = self.inner.reconnect_subscription.lock().unwrap().take() {
            self.inner.monitor.unsubscribe(id);
        }
        self.inner.monitor.shutdown().await;

        tracing::info!("Sync engine shut down");
    }

    /// Run one full sync attempt: push, then pull
    ///
    /// Never panics or returns `Err`; inspect the outcome. A second
    /// concurrent call fails fast with `SyncInProgress`, and an offline
    /// engine fails with `Offline` without touching the transport.
    pub async fn sync(&self) -> SyncOutcome {
        let started = Instant::now();

        if self
            .inner
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync requested while another attempt is in flight");
            return SyncOutcome::failure(Error::SyncInProgress, elapsed_ms(started));
        }

        if !self.inner.monitor.is_online() {
            tracing::debug!("Sync requested while offline");
            self.inner.is_syncing.store(false, Ordering::SeqCst);
            return SyncOutcome::failure(Error::Offline, elapsed_ms(started));
        }

        tracing::info!("Sync started");
        self.update_state(|state| state.begin_sync());

        let outcome = self.run_pipelines(started).await;

        self.inner.is_syncing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_pipelines(&self, started: Instant) -> SyncOutcome {
        let push_summary = match self.inner.push.push().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Push failed: {}", e);
                self.update_state(|state| state.finish_error(e.to_string()));
                return SyncOutcome::failure(e, elapsed_ms(started));
            }
        };

        let pull_summary = match self.inner.pull.pull().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("Pull failed: {}", e);
                self.update_state(|state| state.finish_error(e.to_string()));
                return SyncOutcome {
                    success: false,
                    stats: SyncStats {
                        pushed: push_summary.pushed,
                        failed: push_summary.failed,
                        duration_ms: elapsed_ms(started),
                        ..Default::default()
                    },
                    error: Some(e),
                };
            }
        };

        let pending = self.inner.queue.count_all().await;
        self.update_state(|state| state.finish_success(Utc::now(), pending));

        let stats = SyncStats {
            pushed: push_summary.pushed,
            pulled: pull_summary.pulled,
            failed: push_summary.failed,
            duration_ms: elapsed_ms(started),
        };

        tracing::info!(
            "Sync finished in {} ms: pushed={}, pulled={}, failed={}",
            stats.duration_ms,
            stats.pushed,
            stats.pulled,
            stats.failed
        );

        SyncOutcome {
            success: true,
            stats,
            error: None,
        }
    }

    /// Record a raw mutation in the queue and refresh the pending count
    pub async fn queue_operation(
        &self,
        operation: QueueOperation,
        table: &str,
        record_id: &str,
        payload: &Fields,
    ) -> Result<String> {
        let id = self
            .inner
            .queue
            .enqueue(operation, table, record_id, payload)
            .await?;
        self.refresh_pending().await;
        Ok(id)
    }

    /// Create a record and its CREATE queue entry in one transaction
    pub async fn create_record(&self, table: &str, id: &str, fields: &Fields) -> Result<()> {
        let mut tx = self.inner.store.pool().begin().await?;
        self.inner.store.insert_tx(&mut tx, table, id, fields).await?;
        self.inner
            .queue
            .enqueue_tx(&mut tx, QueueOperation::Create, table, id, fields)
            .await?;
        tx.commit().await?;

        self.refresh_pending().await;
        Ok(())
    }

    /// Merge fields into a record and enqueue the UPDATE atomically
    ///
    /// The queued payload is the post-merge snapshot of the record.
    pub async fn update_record(&self, table: &str, id: &str, fields: &Fields) -> Result<()> {
        let mut tx = self.inner.store.pool().begin().await?;
        let merged = self
            .inner
            .store
            .update_fields_tx(&mut tx, table, id, fields)
            .await?;
        self.inner
            .queue
            .enqueue_tx(&mut tx, QueueOperation::Update, table, id, &merged)
            .await?;
        tx.commit().await?;

        self.refresh_pending().await;
        Ok(())
    }

    /// Soft-delete a record and enqueue the DELETE atomically
    pub async fn delete_record(&self, table: &str, id: &str) -> Result<()> {
        let mut tx = self.inner.store.pool().begin().await?;
        self.inner.store.mark_deleted_tx(&mut tx, table, id).await?;
        self.inner
            .queue
            .enqueue_tx(&mut tx, QueueOperation::Delete, table, id, &Fields::new())
            .await?;
        tx.commit().await?;

        self.refresh_pending().await;
        Ok(())
    }

    /// Defensive copy of the current engine state
    pub fn state(&self) -> SyncState {
        self.inner.state.read().unwrap().clone()
    }

    /// Read access to the local record store
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The engine's network monitor
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.inner.monitor
    }

    /// Dead-letter view: items retried past the configured maximum
    pub async fn failed_items(&self) -> Result<Vec<QueueItem>> {
        self.inner.queue.failed(self.inner.config.max_retries).await
    }

    /// Give every dead item another round of pushes
    pub async fn retry_failed(&self) -> Result<u64> {
        let reset = self
            .inner
            .queue
            .retry_failed(self.inner.config.max_retries)
            .await?;
        self.refresh_pending().await;
        Ok(reset)
    }

    /// Drop every dead item
    pub async fn purge_failed(&self) -> Result<u64> {
        let purged = self
            .inner
            .queue
            .purge_failed(self.inner.config.max_retries)
            .await?;
        self.refresh_pending().await;
        Ok(purged)
    }

    /// Drop the entire queue
    pub async fn purge_queue(&self) -> Result<u64> {
        let purged = self.inner.queue.purge_all().await?;
        self.refresh_pending().await;
        Ok(purged)
    }

    /// Register a state observer; it sees every state mutation
    pub fn subscribe(&self, listener: StateListener) -> ObserverId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().unwrap().insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.inner.listeners.lock().unwrap().remove(&id);
    }

    async fn refresh_pending(&self) {
        let pending = self.inner.queue.count_all().await;
        self.update_state(|state| state.pending_changes = pending);
    }

    /// Apply a state mutation and fan the new state out to observers
    fn update_state<F: FnOnce(&mut SyncState)>(&self, mutate: F) {
        let snapshot = {
            let mut state = self.inner.state.write().unwrap();
            mutate(&mut state);
            state.clone()
        };

        if self.inner.config.debug {
            tracing::debug!("Engine state now {:?}", snapshot);
        }

        let listeners = self.inner.listeners.lock().unwrap();
        for (id, listener) in listeners.iter() {
            // a panicking observer must not take down the engine or
            // starve the observers after it
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::warn!("State listener {} panicked; continuing", id);
            }
        }
    }

    fn start_ticker(&self) {
        let (stop, mut stopped) = watch::channel(false);
        *self.inner.ticker_stop.lock().unwrap() = Some(stop);

        let engine = self.clone();
        let period = self.inner.config.sync_interval;
        let handle = tokio::spawn(async move {
            // no immediate tick; the first sync happens one period in
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if engine.inner.monitor.is_online()
                            && !engine.inner.is_syncing.load(Ordering::SeqCst)
                        {
                            let outcome = engine.sync().await;
                            if let Some(error) = outcome.error {
                                tracing::debug!("Background sync attempt failed: {}", error);
                            }
                        } else {
                            tracing::debug!("Background tick skipped (offline or busy)");
                        }
                    }
                }
            }
        });
        *self.inner.ticker_task.lock().unwrap() = Some(handle);
    }

    fn attach_reconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.monitor.subscribe(Box::new(move |status| {
            if !status.is_connected {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.is_syncing.load(Ordering::SeqCst) {
                return;
            }

            tracing::info!("Connectivity regained; starting sync");
            let engine = SyncEngine { inner };
            tokio::spawn(async move {
                let outcome = engine.sync().await;
                if let Some(error) = outcome.error {
                    tracing::debug!("Reconnect sync attempt failed: {}", error);
                }
            });
        }));
        *self.inner.reconnect_subscription.lock().unwrap() = Some(id);
    }
}
