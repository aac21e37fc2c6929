// sync/mod.rs - Reconciliation core: queue, pipelines, orchestration

pub mod conflict;
pub mod engine;
pub mod network;
pub mod pull;
pub mod push;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod watermark;

pub use conflict::{ConflictContext, ConflictResolver, ConflictStrategy, CustomResolver, Resolution};
pub use engine::{ObserverId, StateListener, SyncEngine, SyncOutcome, SyncStats};
pub use network::{
    ConnectivitySource, NetworkListener, NetworkMonitor, NetworkStatus, Reachability,
    SubscriptionId,
};
pub use pull::{PullPipeline, PullSummary};
pub use push::{PushPipeline, PushSummary};
pub use queue::{QueueItem, QueueOperation, SyncQueue};
pub use retry::RetryPolicy;
pub use transport::{
    HttpTransport, PullRequest, PullResponse, PushChange, PushRequest, PushResponse, PushResult,
    SyncTransport, TableChanges,
};
pub use watermark::{
    KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore, WatermarkStore, LAST_SYNC_KEY,
};
