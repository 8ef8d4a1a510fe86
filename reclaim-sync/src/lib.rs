/// Offline-first sync for the Reclaim point of sale
///
/// Mutations made at the till are queued durably under an idempotency key and
/// replayed against the remote store once connectivity returns. The processed
/// key ledger keeps a replay from applying the same mutation twice.

pub mod operation;
pub mod idempotency;
pub mod ledger;
pub mod queue;
pub mod network;
pub mod remote;
pub mod sync_engine;
pub mod status;

pub use operation::{
    ExpensePayload, MaterialPayload, Operation, OperationKind, OrderLine, OrderPayload,
    TransactionKind, TransactionPayload,
};
pub use idempotency::{payload_hash, IdempotencyKey, KeyGenerator};
pub use ledger::{ProcessedKeyLedger, DEFAULT_LEDGER_CAPACITY};
pub use queue::{DeadLetter, DeadReason, ItemStatus, LocalQueue, QueueItem, QueueItemId, SyncStats};
pub use network::{
    ConnectivitySignal, ManualConnectivity, NetworkMonitor, NetworkState, NetworkStatus,
    SubscriptionId,
};
pub use remote::{RemoteApply, RemoteError, RemoteId, RemoteRegistry};
pub use sync_engine::{ItemOutcome, SkipReason, SyncEngine, SyncEvent, SyncOutcome, NETWORK_LOST_REASON};
pub use status::{SyncSnapshot, SyncStatus};

#[cfg(feature = "http-sync")]
pub use remote::http::HttpRemote;

use std::sync::Arc;
use tokio::task::JoinHandle;

use reclaim_core::{DurableStore, Error, Result, SyncConfig};

/// The sync subsystem as seen by the rest of the application
#[derive(Clone)]
pub struct OfflineSync {
    queue: Arc<LocalQueue>,
    engine: SyncEngine,
    status: SyncStatus,
}

impl OfflineSync {
    pub fn builder() -> OfflineSyncBuilder {
        OfflineSyncBuilder::new()
    }

    /// Queue a mutation for remote application
    pub fn enqueue(&self, operation: Operation) -> Result<QueueItem> {
        self.queue.enqueue(operation)
    }

    /// Queue a mutation under a caller-supplied key
    pub fn enqueue_with_key(&self, operation: Operation, key: IdempotencyKey) -> Result<QueueItem> {
        self.queue.enqueue_with_key(operation, key)
    }

    /// Drain the queue now
    pub async fn force_sync(&self) -> SyncOutcome {
        self.engine.force_sync().await
    }

    pub fn stats(&self) -> SyncStats {
        self.queue.stats()
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.engine.is_sync_in_progress()
    }

    /// Register a callback for connectivity transitions
    pub fn subscribe_network_status<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(NetworkStatus) + Send + Sync + 'static,
    {
        self.engine.monitor().subscribe(listener)
    }

    pub fn unsubscribe_network_status(&self, id: SubscriptionId) -> bool {
        self.engine.monitor().unsubscribe(id)
    }

    /// Feed the monitor from a platform connectivity signal
    pub fn attach_connectivity<S>(&self, signal: &S) -> JoinHandle<()>
    where
        S: ConnectivitySignal + ?Sized,
    {
        self.engine.monitor().attach(signal)
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<LocalQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        self.engine.monitor()
    }

    /// Begin automatic draining on reconnect (and on the poll interval, if set)
    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    pub async fn stop(&self) {
        self.engine.stop().await
    }
}

/// Builder for the sync subsystem
pub struct OfflineSyncBuilder {
    store: Option<Arc<dyn DurableStore>>,
    remote: RemoteRegistry,
    monitor: Option<NetworkMonitor>,
    config: SyncConfig,
}

impl OfflineSyncBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            remote: RemoteRegistry::new(),
            monitor: None,
            config: SyncConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Route one operation kind to an applier
    pub fn with_remote(mut self, kind: OperationKind, applier: Arc<dyn RemoteApply>) -> Self {
        self.remote = self.remote.register(kind, applier);
        self
    }

    /// Route every operation kind to the same applier
    pub fn with_remote_for_all(mut self, applier: Arc<dyn RemoteApply>) -> Self {
        self.remote = self.remote.register_all(applier);
        self
    }

    pub fn with_registry(mut self, registry: RemoteRegistry) -> Self {
        self.remote = registry;
        self
    }

    /// Use an existing monitor. Without one the monitor starts Offline until
    /// a connectivity signal reports otherwise.
    pub fn with_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<OfflineSync> {
        let store = self
            .store
            .ok_or_else(|| Error::InvalidConfig("a durable store is required".to_string()))?;

        let queue = Arc::new(LocalQueue::open(store, &self.config)?);
        let monitor = self.monitor.unwrap_or_else(|| NetworkMonitor::new(false));
        let engine = SyncEngine::new(queue.clone(), self.remote, monitor, self.config)?;
        let status = SyncStatus::new(engine.clone());

        Ok(OfflineSync {
            queue,
            engine,
            status,
        })
    }
}

impl Default for OfflineSyncBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reclaim_core::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRemote {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteApply for CountingRemote {
        async fn apply(&self, _operation: &Operation, key: &IdempotencyKey) -> std::result::Result<RemoteId, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteId(key.to_string()))
        }
    }

    fn expense() -> Operation {
        Operation::CreateExpense(ExpensePayload {
            description: "forklift fuel".to_string(),
            category: "fuel".to_string(),
            amount_cents: 4_500,
            incurred_at: chrono::Utc::now(),
        })
    }

    #[test]
    fn test_builder_requires_store() {
        assert!(matches!(OfflineSync::builder().build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = OfflineSync::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .with_config(SyncConfig::new().with_max_attempts(0))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_enqueue_then_sync() {
        let remote = Arc::new(CountingRemote {
            calls: AtomicUsize::new(0),
        });
        let sync = OfflineSync::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .with_remote_for_all(remote.clone())
            .with_monitor(NetworkMonitor::new(true))
            .build()
            .unwrap();

        sync.enqueue(expense()).unwrap();
        sync.enqueue(expense()).unwrap();
        assert_eq!(sync.stats().pending, 2);

        let outcome = sync.force_sync().await;
        assert_eq!(outcome.success, 2);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sync.stats().total, 0);
        assert!(sync.status().last_sync_timestamp().is_some());
    }

    #[test]
    fn test_network_subscription_roundtrip() {
        let sync = OfflineSync::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let id = sync.subscribe_network_status(move |status| sink.lock().push(status.connected));
        sync.monitor().observe(true);
        assert!(sync.unsubscribe_network_status(id));
        sync.monitor().observe(false);

        assert_eq!(*seen.lock(), vec![true]);
    }
}
