/// Network connectivity monitoring
///
/// Tracks the Online/Offline state fed by a platform connectivity signal and
/// notifies subscribers once per transition. The monitor only notifies; the
/// sync engine decides what to do about a reconnect.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connectivity as reported to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
}

impl NetworkStatus {
    pub fn state(&self) -> NetworkState {
        if self.connected {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }
}

/// Two-state connectivity machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Online,
    Offline,
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Callback invoked on every connectivity transition
pub type NetworkListener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Source of platform connectivity changes
pub trait ConnectivitySignal: Send + Sync {
    /// Receiver yielding `true` while connected
    fn watch(&self) -> watch::Receiver<bool>;
}

/// Connectivity signal driven by explicit calls
///
/// Used by tests and by hosts that learn about connectivity from their own
/// event loop.
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    /// Report a connectivity change
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_replace(connected);
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ConnectivitySignal for ManualConnectivity {
    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

struct MonitorInner {
    transition: Mutex<()>,
    status_tx: watch::Sender<NetworkStatus>,
    listeners: RwLock<BTreeMap<SubscriptionId, NetworkListener>>,
    next_id: AtomicU64,
}

/// Observes connectivity and notifies subscribers of transitions
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Create a monitor with a known initial state
    pub fn new(connected: bool) -> Self {
        let (status_tx, _) = watch::channel(NetworkStatus { connected });
        Self {
            inner: Arc::new(MonitorInner {
                transition: Mutex::new(()),
                status_tx,
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current connectivity
    pub fn current_status(&self) -> NetworkStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current_status().connected
    }

    /// Feed an observation from the connectivity signal.
    ///
    /// Returns true if it caused a transition. Repeated identical
    /// observations are swallowed, so each transition is emitted once.
    pub fn observe(&self, connected: bool) -> bool {
        let status = {
            let _guard = self.inner.transition.lock();
            if self.current_status().connected == connected {
                return false;
            }
            let status = NetworkStatus { connected };
            self.inner.status_tx.send_replace(status);
            status
        };

        info!(state = ?status.state(), "Network status changed");

        // Listeners run outside the lock so they may query the monitor
        let listeners: Vec<NetworkListener> = self.inner.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
        true
    }

    /// Register a listener for status transitions
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().insert(id, Arc::new(listener));
        debug!(subscription = id.0, "Network listener subscribed");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.write().remove(&id).is_some()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Receiver for async consumers that prefer awaiting over callbacks
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Follow a connectivity signal until it closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, signal: &S) -> JoinHandle<()>
    where
        S: ConnectivitySignal + ?Sized,
    {
        let mut rx = signal.watch();
        let monitor = self.clone();

        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            monitor.observe(initial);

            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                monitor.observe(connected);
            }
            debug!("Connectivity signal closed");
        })
    }
}
