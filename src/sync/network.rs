// sync/network.rs - Reachability monitoring with listener fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Tri-state internet reachability: connectivity to a network does not
/// imply the wider internet is reachable, and probes may not know yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Yes,
    No,
    Unknown,
}

/// Last-known connectivity snapshot from the platform probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub is_internet_reachable: Reachability,
    /// Link kind reported by the platform (wifi, cellular, ...)
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Reachability::Unknown,
            kind: None,
        }
    }
}

impl NetworkStatus {
    /// Online means connected and not provably unreachable
    pub fn online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Reachability::No
    }

    /// Whether the transition to `next` is worth telling listeners about
    ///
    /// Link-kind changes alone (wifi -> cellular) are suppressed.
    fn observable_change(&self, next: &NetworkStatus) -> bool {
        self.is_connected != next.is_connected
            || self.is_internet_reachable != next.is_internet_reachable
    }
}

/// Platform connectivity probe
///
/// `current` answers an on-demand fetch; `events` hands out a stream of
/// status updates pushed by the platform.
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    async fn current(&self) -> NetworkStatus;
    fn events(&self) -> mpsc::UnboundedReceiver<NetworkStatus>;
}

pub type NetworkListener = Box<dyn Fn(&NetworkStatus) + Send + Sync>;

/// Identifier handed back by [`NetworkMonitor::subscribe`]
pub type SubscriptionId = u64;

/// Owns the last-known network status and fans out observable changes
pub struct NetworkMonitor {
    source: Arc<dyn ConnectivitySource>,
    status: RwLock<NetworkStatus>,
    listeners: Mutex<HashMap<SubscriptionId, NetworkListener>>,
    next_listener_id: AtomicU64,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        Self {
            source,
            status: RwLock::new(NetworkStatus::default()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            shutdown_tx: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    /// Fetch the current status once and start consuming change events
    pub async fn initialize(self: &Arc<Self>) {
        let initial = self.source.current().await;
        *self.status.write().unwrap() = initial;

        let mut events = self.source.events();
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(tx);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    event = events.recv() => match event {
                        Some(status) => monitor.apply(status),
                        None => break,
                    },
                }
            }
        });
        *self.event_task.lock().unwrap() = Some(handle);
    }

    /// Synchronous reachability answer from the last-known status
    pub fn is_online(&self) -> bool {
        self.status.read().unwrap().online()
    }

    /// Defensive copy of the last-known status
    pub fn status(&self) -> NetworkStatus {
        self.status.read().unwrap().clone()
    }

    /// Register a listener for observable status changes
    pub fn subscribe(&self, listener: NetworkListener) -> SubscriptionId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().remove(&id);
    }

    /// Stop consuming platform events and drop all listeners
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let handle = self.event_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.listeners.lock().unwrap().clear();
    }

    fn apply(&self, next: NetworkStatus) {
        let changed = {
            let mut current = self.status.write().unwrap();
            let changed = current.observable_change(&next);
            *current = next.clone();
            changed
        };

        if !changed {
            return;
        }

        tracing::debug!(
            "Network status changed: connected={}, reachable={:?}, kind={:?}",
            next.is_connected,
            next.is_internet_reachable,
            next.kind
        );

        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.values() {
            listener(&next);
        }
    }
}
