// config.rs - Engine configuration

use std::time::Duration;

use crate::sync::conflict::{ConflictStrategy, CustomResolver};
use crate::{Error, Result};

/// Configuration for the sync engine
///
/// `Default` matches the documented defaults; hosts typically set
/// `tables` and leave the rest alone.
#[derive(Clone)]
pub struct SyncConfig {
    /// Synced collections, pulled in this order
    pub tables: Vec<String>,
    /// How concurrent edits are resolved during pull
    pub conflict_strategy: ConflictStrategy,
    /// Required when `conflict_strategy` is `Custom`
    pub custom_conflict_resolver: Option<CustomResolver>,
    /// Background sync cadence
    pub sync_interval: Duration,
    /// A queue item is dead once `retry_count` reaches this
    pub max_retries: u32,
    /// Base for exponential backoff on transient transport failures
    pub retry_delay_base: Duration,
    /// Start the background ticker on `initialize()`
    pub enable_background_sync: bool,
    /// Trigger a sync when connectivity is regained
    pub sync_on_reconnect: bool,
    /// Maximum queue items per push request
    pub push_batch_size: usize,
    /// Verbose per-item diagnostics
    pub debug: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            conflict_strategy: ConflictStrategy::LastWriteWins,
            custom_conflict_resolver: None,
            sync_interval: Duration::from_secs(300),
            max_retries: 3,
            retry_delay_base: Duration::from_millis(1000),
            enable_background_sync: true,
            sync_on_reconnect: true,
            push_batch_size: 50,
            debug: false,
        }
    }
}

impl SyncConfig {
    /// Validate the configuration before the engine is built
    pub fn validate(&self) -> Result<()> {
        if self.conflict_strategy == ConflictStrategy::Custom
            && self.custom_conflict_resolver.is_none()
        {
            return Err(Error::Config(
                "custom conflict strategy requires a resolver function".to_string(),
            ));
        }
        if self.push_batch_size == 0 {
            return Err(Error::Config("push_batch_size must be at least 1".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::Config("sync_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
