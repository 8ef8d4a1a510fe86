/// Sync engine that drains the local queue against the remote store
///
/// A drain pass walks a snapshot of the pending items in creation order and
/// applies each one through the remote registry. Individual failures never
/// abort the pass; losing connectivity halts the remainder, which waits for
/// the next Online transition.
///
/// Drains are triggered explicitly (`force_sync`), by a debounced reconnect,
/// or by the optional polling loop. At most one drain runs at a time: a call
/// that arrives while another drain is in flight returns zero counts at once.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use reclaim_core::{Error, Result, SyncConfig};

use crate::network::{NetworkMonitor, NetworkStatus, SubscriptionId};
use crate::queue::{DeadReason, ItemStatus, LocalQueue, QueueItemId};
use crate::remote::{RemoteError, RemoteId, RemoteRegistry};

/// Reason recorded on items halted because connectivity dropped mid-drain
pub const NETWORK_LOST_REASON: &str = "network lost mid-sync";

const LAST_SYNC_KEY: &str = "sync#last";

/// Aggregate result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Items applied, including ones found already applied
    pub success: usize,
    /// Items that failed this pass, including retired ones
    pub failed: usize,
    /// Items moved to the dead set this pass
    pub retired: usize,
}

/// Result of processing a single item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The remote accepted the operation
    Applied(RemoteId),
    /// The key was already in the processed ledger; no remote call was made
    AlreadyApplied,
    /// The attempt failed and the item stays queued
    Failed(RemoteError),
    /// The item was moved to the dead set
    Retired(DeadReason),
    /// The item is gone or another caller is already processing it
    Skipped,
    /// The local store could not record the transition
    LocalError(String),
}

/// Why a drain request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Events that can be observed during draining
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    DrainStarted {
        pending: usize,
    },
    ItemApplied {
        id: QueueItemId,
        remote_id: Option<RemoteId>,
    },
    ItemFailed {
        id: QueueItemId,
        attempts: u32,
        error: String,
    },
    ItemRetired {
        id: QueueItemId,
        reason: DeadReason,
    },
    DrainCompleted {
        outcome: SyncOutcome,
    },
    DrainSkipped {
        reason: SkipReason,
    },
}

/// Engine-side part of the status projection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineState {
    pub in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RunState {
    subscription: Option<SubscriptionId>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

struct EngineInner {
    queue: Arc<LocalQueue>,
    remote: RemoteRegistry,
    monitor: NetworkMonitor,
    config: SyncConfig,
    in_progress: AtomicBool,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    /// Bumped on every network transition; a debounced drain only fires if
    /// no newer transition happened while it slept
    debounce_generation: AtomicU64,
    event_tx: broadcast::Sender<SyncEvent>,
    state_tx: watch::Sender<EngineState>,
    run: Mutex<RunState>,
}

/// Releases the re-entrancy flag when a drain ends, however it ends
struct DrainGuard<'a> {
    inner: &'a EngineInner,
}

impl<'a> DrainGuard<'a> {
    fn acquire(inner: &'a EngineInner) -> Option<Self> {
        inner
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        inner.state_tx.send_modify(|s| s.in_progress = true);
        Some(Self { inner })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_progress.store(false, Ordering::Release);
        self.inner.state_tx.send_modify(|s| s.in_progress = false);
    }
}

/// Main sync engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create a new sync engine over an opened queue
    pub fn new(
        queue: Arc<LocalQueue>,
        remote: RemoteRegistry,
        monitor: NetworkMonitor,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let last_sync = match queue.store().get(LAST_SYNC_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read last sync time: {}", e);
                None
            }
        };

        let (event_tx, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(EngineState {
            in_progress: false,
            last_sync,
        });

        Ok(Self {
            inner: Arc::new(EngineInner {
                queue,
                remote,
                monitor,
                config,
                in_progress: AtomicBool::new(false),
                last_sync: RwLock::new(last_sync),
                debounce_generation: AtomicU64::new(0),
                event_tx,
                state_tx,
                run: Mutex::new(RunState::default()),
            }),
        })
    }

    /// Start reacting to connectivity changes, and polling if configured.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("sync engine needs a tokio runtime: {}", e)))?;

        let mut run = self.inner.run.lock();
        if run.subscription.is_some() {
            warn!("Sync engine already running");
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let listener_handle = handle.clone();
        let subscription = self.inner.monitor.subscribe(move |status| {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.on_network_change(status, &listener_handle);
            }
        });
        run.subscription = Some(subscription);

        if let Some(interval) = self.inner.config.poll_interval {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            run.shutdown_tx = Some(shutdown_tx);
            handle.spawn(Self::poll_loop(Arc::downgrade(&self.inner), interval, shutdown_rx));
        }

        info!("Sync engine started");
        Ok(())
    }

    /// Stop reacting to connectivity changes and stop polling
    pub async fn stop(&self) {
        let shutdown_tx = {
            let mut run = self.inner.run.lock();
            if let Some(subscription) = run.subscription.take() {
                self.inner.monitor.unsubscribe(subscription);
            }
            run.shutdown_tx.take()
        };

        // Cancel any debounced drain still sleeping
        self.inner.debounce_generation.fetch_add(1, Ordering::AcqRel);

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }
        info!("Sync engine stopped");
    }

    async fn poll_loop(inner: Weak<EngineInner>, interval: std::time::Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let engine = SyncEngine { inner };
                    if engine.inner.monitor.is_online() && !engine.inner.queue.is_empty() {
                        engine.force_sync().await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
        debug!("Sync poll loop exited");
    }

    fn on_network_change(&self, status: NetworkStatus, handle: &tokio::runtime::Handle) {
        let generation = self.inner.debounce_generation.fetch_add(1, Ordering::AcqRel) + 1;

        if !status.connected {
            debug!("Offline, cancelling any scheduled drain");
            return;
        }

        let engine = self.clone();
        let delay = self.inner.config.reconnect_debounce;
        debug!(delay_ms = delay.as_millis() as u64, "Online, scheduling drain");

        handle.spawn(async move {
            time::sleep(delay).await;

            if engine.inner.debounce_generation.load(Ordering::Acquire) != generation {
                debug!("Connectivity changed during debounce, drain dropped");
                return;
            }
            if !engine.inner.monitor.is_online() {
                return;
            }

            let outcome = engine.force_sync().await;
            debug!(?outcome, "Reconnect drain finished");
        });
    }

    /// Drain the current pending set.
    ///
    /// Returns zero counts without touching the queue if another drain is in
    /// flight or the network is offline. Remote errors are absorbed into
    /// per-item transitions and never returned.
    pub async fn force_sync(&self) -> SyncOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.inner) else {
            debug!("Drain already in progress, ignoring request");
            self.emit(SyncEvent::DrainSkipped {
                reason: SkipReason::AlreadyRunning,
            });
            return SyncOutcome::default();
        };

        if !self.inner.monitor.is_online() {
            debug!("Offline, skipping drain");
            self.emit(SyncEvent::DrainSkipped {
                reason: SkipReason::Offline,
            });
            return SyncOutcome::default();
        }

        let snapshot: Vec<QueueItemId> = self.inner.queue.list_pending().map(|item| item.id).collect();
        info!(pending = snapshot.len(), "Starting drain");
        self.emit(SyncEvent::DrainStarted {
            pending: snapshot.len(),
        });

        let mut outcome = SyncOutcome::default();
        let mut remaining = snapshot.into_iter();

        while let Some(id) = remaining.next() {
            if !self.inner.monitor.is_online() {
                outcome.failed += self.halt(std::iter::once(id).chain(remaining.by_ref()));
                break;
            }

            match self.process_item(id).await {
                ItemOutcome::Applied(_) | ItemOutcome::AlreadyApplied => outcome.success += 1,
                ItemOutcome::Retired(_) => {
                    outcome.failed += 1;
                    outcome.retired += 1;
                }
                ItemOutcome::LocalError(_) => outcome.failed += 1,
                ItemOutcome::Skipped => {}
                ItemOutcome::Failed(err) => {
                    outcome.failed += 1;
                    if matches!(err, RemoteError::NetworkLost(_)) || !self.inner.monitor.is_online() {
                        outcome.failed += self.halt(remaining.by_ref());
                        break;
                    }
                }
            }
        }

        self.stamp_last_sync();
        info!(
            success = outcome.success,
            failed = outcome.failed,
            retired = outcome.retired,
            "Drain completed"
        );
        self.emit(SyncEvent::DrainCompleted { outcome });
        outcome
    }

    /// Mark every remaining item of the pass as failed without calling the remote
    fn halt(&self, ids: impl Iterator<Item = QueueItemId>) -> usize {
        let mut halted = 0;
        for id in ids {
            let Some(item) = self.inner.queue.get(id) else { continue };
            if item.status == ItemStatus::Processing {
                continue;
            }
            match self.inner.queue.mark_failed(id, NETWORK_LOST_REASON) {
                Ok(_) => halted += 1,
                Err(e) => error!(id = %id, "Failed to record halted item: {}", e),
            }
        }
        if halted > 0 {
            warn!(halted, "Network lost mid-sync, halting remaining items");
        }
        halted
    }

    /// Apply a single queued item.
    ///
    /// Reads the live item, so calling it for an item that has already been
    /// applied or is being applied by another caller makes no remote call.
    pub async fn process_item(&self, id: QueueItemId) -> ItemOutcome {
        let queue = &self.inner.queue;

        let Some(item) = queue.get(id) else {
            return ItemOutcome::Skipped;
        };
        if item.status == ItemStatus::Processing {
            return ItemOutcome::Skipped;
        }

        if queue.ledger_contains(&item.idempotency_key) {
            debug!(id = %id, key = %item.idempotency_key, "Key already applied, settling without remote call");
            return match queue.mark_success(id) {
                Ok(()) => {
                    self.emit(SyncEvent::ItemApplied { id, remote_id: None });
                    ItemOutcome::AlreadyApplied
                }
                Err(e) => self.local_error(id, e),
            };
        }

        let item = match queue.mark_processing(id) {
            Ok(item) => item,
            Err(Error::InvalidArgument(_)) | Err(Error::NotFound(_)) => return ItemOutcome::Skipped,
            Err(e) => return self.local_error(id, e),
        };

        let timeout = self.inner.config.apply_timeout;
        let result = match time::timeout(
            timeout,
            self.inner.remote.apply(&item.operation, &item.idempotency_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        };

        match result {
            Ok(remote_id) => match queue.mark_success(id) {
                Ok(()) => {
                    debug!(id = %id, remote_id = %remote_id, "Applied item");
                    self.emit(SyncEvent::ItemApplied {
                        id,
                        remote_id: Some(remote_id.clone()),
                    });
                    ItemOutcome::Applied(remote_id)
                }
                Err(e) => {
                    // The remote has it; the retry will reach the backend again
                    // unless the ledger write went through before the failure
                    if let Err(mark_err) = queue.mark_failed(id, format!("local commit failed: {}", e)) {
                        error!(id = %id, "Item stuck in processing until restart: {}", mark_err);
                    }
                    self.local_error(id, e)
                }
            },
            Err(err) => self.record_failure(id, item.attempts, err),
        }
    }

    fn record_failure(&self, id: QueueItemId, attempts: u32, err: RemoteError) -> ItemOutcome {
        let queue = &self.inner.queue;
        warn!(id = %id, attempts, "Remote apply failed: {}", err);

        if matches!(err, RemoteError::NetworkLost(_)) {
            return match queue.mark_interrupted(id, err.to_string()) {
                Ok(item) => {
                    self.emit(SyncEvent::ItemFailed {
                        id,
                        attempts: item.attempts,
                        error: err.to_string(),
                    });
                    ItemOutcome::Failed(err)
                }
                Err(e) => self.local_error(id, e),
            };
        }

        let retire_reason = if !err.is_retryable() {
            Some(DeadReason::Rejected)
        } else if attempts >= self.inner.config.max_attempts {
            Some(DeadReason::RetriesExhausted)
        } else {
            None
        };

        if let Some(reason) = retire_reason {
            return match queue.retire(id, reason, err.to_string()) {
                Ok(_) => {
                    self.emit(SyncEvent::ItemRetired { id, reason });
                    ItemOutcome::Retired(reason)
                }
                Err(e) => self.local_error(id, e),
            };
        }

        match queue.mark_failed(id, err.to_string()) {
            Ok(_) => {
                self.emit(SyncEvent::ItemFailed {
                    id,
                    attempts,
                    error: err.to_string(),
                });
                ItemOutcome::Failed(err)
            }
            Err(e) => self.local_error(id, e),
        }
    }

    fn local_error(&self, id: QueueItemId, err: Error) -> ItemOutcome {
        error!(id = %id, code = err.code(), "Local store error during sync: {}", err);
        ItemOutcome::LocalError(err.to_string())
    }

    fn stamp_last_sync(&self) {
        let now = Utc::now();
        *self.inner.last_sync.write() = Some(now);
        self.inner.state_tx.send_modify(|s| s.last_sync = Some(now));

        let persisted = serde_json::to_vec(&now)
            .map_err(Error::from)
            .and_then(|json| self.inner.queue.store().put(LAST_SYNC_KEY, Bytes::from(json)));
        if let Err(e) = persisted {
            warn!("Could not persist last sync time: {}", e);
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Whether a drain is currently running
    pub fn is_sync_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// When the last drain pass completed
    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync.read()
    }

    /// Subscribe to sync events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Receive engine state every time it changes
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    pub fn queue(&self) -> &Arc<LocalQueue> {
        &self.inner.queue
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.inner.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyKey;
    use crate::operation::{MaterialPayload, Operation};
    use crate::remote::RemoteApply;
    use async_trait::async_trait;
    use reclaim_core::MemoryStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Remote that records calls and answers from a script
    struct ScriptedRemote {
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<RemoteError>>,
        delay: Option<Duration>,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl ScriptedRemote {
        fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
                delay: None,
                gate: None,
                entered: Arc::new(Notify::new()),
            }
        }

        fn failing(err: RemoteError) -> Self {
            let remote = Self::ok();
            *remote.fail_with.lock() = Some(err);
            remote
        }

        fn call_names(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteApply for ScriptedRemote {
        async fn apply(&self, operation: &Operation, key: &IdempotencyKey) -> std::result::Result<RemoteId, RemoteError> {
            let name = match operation {
                Operation::CreateMaterial(p) => p.name.clone(),
                other => other.kind().to_string(),
            };
            self.calls.lock().push(name);
            self.entered.notify_one();

            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            if let Some(err) = self.fail_with.lock().clone() {
                return Err(err);
            }
            Ok(RemoteId(format!("srv-{}", key)))
        }
    }

    fn material(name: &str) -> Operation {
        Operation::CreateMaterial(MaterialPayload {
            name: name.to_string(),
            category: "metal".to_string(),
            buy_price_cents_per_kg: 100,
            sell_price_cents_per_kg: 140,
        })
    }

    fn engine_with(remote: Arc<ScriptedRemote>, config: SyncConfig, online: bool) -> SyncEngine {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(LocalQueue::open(store, &config).unwrap());
        let registry = RemoteRegistry::new().register_all(remote);
        SyncEngine::new(queue, registry, NetworkMonitor::new(online), config).unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_device_prefix("till01")
            .with_max_attempts(3)
            .with_apply_timeout(Duration::from_millis(200))
            .with_reconnect_debounce(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_drain_applies_in_fifo_order() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config(), true);

        for name in ["a", "b", "c"] {
            engine.queue().enqueue(material(name)).unwrap();
        }

        let outcome = engine.force_sync().await;
        assert_eq!(outcome, SyncOutcome { success: 3, failed: 0, retired: 0 });
        assert_eq!(remote.call_names(), vec!["a", "b", "c"]);
        assert_eq!(engine.queue().stats().total, 0);
        assert!(engine.last_sync_timestamp().is_some());
    }

    #[tokio::test]
    async fn test_failed_items_stay_queued_then_retire() {
        let remote = Arc::new(ScriptedRemote::failing(RemoteError::Transient("503".into())));
        let engine = engine_with(remote.clone(), config(), true);
        let item = engine.queue().enqueue(material("a")).unwrap();

        let first = engine.force_sync().await;
        assert_eq!(first, SyncOutcome { success: 0, failed: 1, retired: 0 });
        let queued = engine.queue().get(item.id).unwrap();
        assert_eq!(queued.status, ItemStatus::Failed);
        assert_eq!(queued.attempts, 1);

        engine.force_sync().await;
        let third = engine.force_sync().await;
        assert_eq!(third.retired, 1);

        // Nothing left to call
        engine.force_sync().await;
        assert_eq!(remote.call_names().len(), 3);
        assert_eq!(engine.queue().dead_letters()[0].reason, DeadReason::RetriesExhausted);
    }

    #[tokio::test]
    async fn test_permanent_error_retires_immediately() {
        let remote = Arc::new(ScriptedRemote::failing(RemoteError::Permanent("422".into())));
        let engine = engine_with(remote.clone(), config(), true);
        engine.queue().enqueue(material("a")).unwrap();

        let outcome = engine.force_sync().await;
        assert_eq!(outcome, SyncOutcome { success: 0, failed: 1, retired: 1 });
        assert_eq!(engine.queue().dead_letters()[0].reason, DeadReason::Rejected);
    }

    #[tokio::test]
    async fn test_ledger_hit_skips_remote_call() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config(), true);
        let item = engine.queue().enqueue(material("a")).unwrap();
        engine.queue().record_processed_key(item.idempotency_key.clone()).unwrap();

        assert_eq!(engine.process_item(item.id).await, ItemOutcome::AlreadyApplied);
        assert!(remote.call_names().is_empty());
        assert!(engine.queue().get(item.id).is_none());
    }

    #[tokio::test]
    async fn test_process_item_twice_calls_remote_once() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config(), true);
        let item = engine.queue().enqueue(material("a")).unwrap();

        assert!(matches!(engine.process_item(item.id).await, ItemOutcome::Applied(_)));
        assert_eq!(engine.process_item(item.id).await, ItemOutcome::Skipped);
        assert_eq!(remote.call_names().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let mut remote = ScriptedRemote::ok();
        remote.delay = Some(Duration::from_secs(5));
        let remote = Arc::new(remote);
        let engine = engine_with(remote.clone(), config(), true);
        let item = engine.queue().enqueue(material("a")).unwrap();

        match engine.process_item(item.id).await {
            ItemOutcome::Failed(RemoteError::Timeout(_)) => (),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert_eq!(engine.queue().get(item.id).unwrap().status, ItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_network_lost_halts_remaining_items() {
        let remote = Arc::new(ScriptedRemote::failing(RemoteError::NetworkLost("reset".into())));
        let engine = engine_with(remote.clone(), config(), true);
        let a = engine.queue().enqueue(material("a")).unwrap();
        let b = engine.queue().enqueue(material("b")).unwrap();
        let c = engine.queue().enqueue(material("c")).unwrap();

        let outcome = engine.force_sync().await;
        assert_eq!(outcome.failed, 3);
        assert_eq!(remote.call_names(), vec!["a"]);

        // The interrupted attempt is not counted
        assert_eq!(engine.queue().get(a.id).unwrap().attempts, 0);
        for id in [b.id, c.id] {
            let item = engine.queue().get(id).unwrap();
            assert_eq!(item.status, ItemStatus::Failed);
            assert_eq!(item.attempts, 0);
            assert_eq!(item.last_error.as_deref(), Some(NETWORK_LOST_REASON));
        }

        // Repeated connectivity loss never retires anything
        for _ in 0..5 {
            engine.force_sync().await;
        }
        assert!(engine.queue().dead_letters().is_empty());
        assert_eq!(engine.queue().stats().failed, 3);
    }

    #[tokio::test]
    async fn test_offline_drain_is_skipped() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config(), false);
        engine.queue().enqueue(material("a")).unwrap();

        assert_eq!(engine.force_sync().await, SyncOutcome::default());
        assert!(remote.call_names().is_empty());
        assert_eq!(engine.queue().stats().pending, 1);
        assert!(engine.last_sync_timestamp().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_force_sync_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let mut remote = ScriptedRemote::ok();
        remote.gate = Some(gate.clone());
        let remote = Arc::new(remote);
        let engine = engine_with(remote.clone(), config(), true);
        engine.queue().enqueue(material("a")).unwrap();

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.force_sync().await }
        });

        remote.entered.notified().await;
        assert!(engine.is_sync_in_progress());
        assert_eq!(engine.force_sync().await, SyncOutcome::default());

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert_eq!(outcome.success, 1);
        assert_eq!(remote.call_names().len(), 1);
        assert!(!engine.is_sync_in_progress());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_debounced_drain() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config(), false);
        for name in ["a", "b", "c"] {
            engine.queue().enqueue(material(name)).unwrap();
        }
        engine.start().unwrap();
        let mut events = engine.subscribe_events();

        engine.monitor().observe(true);

        let completed = time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SyncEvent::DrainCompleted { outcome }) = events.recv().await {
                    return outcome;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(completed.success, 3);
        assert_eq!(engine.queue().stats().total, 0);
        assert!(engine.last_sync_timestamp().is_some());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_flapping_connection_cancels_drain() {
        let remote = Arc::new(ScriptedRemote::ok());
        let engine = engine_with(remote.clone(), config().with_reconnect_debounce(Duration::from_millis(100)), false);
        engine.queue().enqueue(material("a")).unwrap();
        engine.start().unwrap();

        engine.monitor().observe(true);
        engine.monitor().observe(false);
        time::sleep(Duration::from_millis(250)).await;

        assert!(remote.call_names().is_empty());
        assert_eq!(engine.queue().stats().pending, 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_last_sync_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(ScriptedRemote::ok());
        let stamped = {
            let queue = Arc::new(LocalQueue::open(store.clone(), &config()).unwrap());
            let registry = RemoteRegistry::new().register_all(remote.clone());
            let engine = SyncEngine::new(queue, registry, NetworkMonitor::new(true), config()).unwrap();
            engine.force_sync().await;
            engine.last_sync_timestamp()
        };

        let queue = Arc::new(LocalQueue::open(store, &config()).unwrap());
        let engine = SyncEngine::new(queue, RemoteRegistry::new(), NetworkMonitor::new(true), config()).unwrap();
        assert_eq!(engine.last_sync_timestamp(), stamped);
    }
}
