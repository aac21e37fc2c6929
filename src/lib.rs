// lib.rs - Main library entry point

//! Offline-first sync engine: applications write to the local store
//! with immediate success, and the engine reconciles with the remote
//! service in the background (push batched local mutations, pull
//! incremental server changes, resolve conflicts, survive restarts).

mod config;
mod db;
mod error;
mod state;
mod sync;

pub use config::SyncConfig;
pub use db::store::{Fields, RecordSyncStatus, Store, StoredRecord};
pub use db::Database;
pub use error::{Error, Result};
pub use state::{SyncState, SyncStatus};
pub use sync::{
    ConflictContext, ConflictResolver, ConflictStrategy, ConnectivitySource, CustomResolver,
    HttpTransport, KeyValueStore, MemoryKeyValueStore, NetworkListener, NetworkMonitor,
    NetworkStatus, ObserverId, PullPipeline, PullRequest, PullResponse, PullSummary, PushChange,
    PushPipeline, PushRequest, PushResponse, PushResult, PushSummary, QueueItem, QueueOperation,
    Reachability, Resolution, RetryPolicy, SqliteKeyValueStore, StateListener, SubscriptionId,
    SyncEngine, SyncOutcome, SyncQueue, SyncStats, SyncTransport, TableChanges, WatermarkStore,
    LAST_SYNC_KEY,
};
