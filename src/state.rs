// state.rs - Observable engine state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-level status of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

/// Snapshot of the engine published to observers
///
/// Observers always receive a copy; mutating it has no effect on the
/// engine. `pending_changes` is advisory and refreshed after every
/// queue mutation and every sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_changes: i64,
    pub error: Option<String>,
    pub is_syncing: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_sync_at: None,
            pending_changes: 0,
            error: None,
            is_syncing: false,
        }
    }
}

impl SyncState {
    /// Transition into the syncing state
    pub fn begin_sync(&mut self) {
        self.status = SyncStatus::Syncing;
        self.is_syncing = true;
    }

    /// Transition back to idle after a fully-successful sync
    pub fn finish_success(&mut self, at: DateTime<Utc>, pending: i64) {
        self.status = SyncStatus::Idle;
        self.last_sync_at = Some(at);
        self.pending_changes = pending;
        self.error = None;
        self.is_syncing = false;
    }

    /// Record a failed sync attempt
    pub fn finish_error(&mut self, message: String) {
        self.status = SyncStatus::Error;
        self.error = Some(message);
        self.is_syncing = false;
    }
}
