/// Test utilities for the Reclaim sync subsystem
///
/// Provides a recording remote backend, a store that fails on demand, a
/// file-backed sync harness that can be reopened, and sample operations.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use reclaim_core::{DurableStore, Error, FileStore, MemoryStore, Result, SyncConfig};
use reclaim_sync::{
    ExpensePayload, IdempotencyKey, MaterialPayload, NetworkMonitor, OfflineSync, Operation,
    OperationKind, OrderLine, OrderPayload, RemoteApply, RemoteError, RemoteId, TransactionKind,
    TransactionPayload,
};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// One call received by `RecordingRemote`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub kind: OperationKind,
    pub key: IdempotencyKey,
    pub operation: Operation,
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// In-process stand-in for the remote backend.
///
/// Records every call in order and deduplicates by idempotency key the way
/// a well-behaved backend would. Outcomes can be scripted per call.
#[derive(Default)]
pub struct RecordingRemote {
    calls: Mutex<Vec<RecordedCall>>,
    applied: Mutex<HashSet<IdempotencyKey>>,
    script: Mutex<VecDeque<RemoteError>>,
    sticky: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<Notify>>>,
    hook: Mutex<Option<CallHook>>,
    entered: Arc<Notify>,
}

impl RecordingRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next call with `err`; later calls succeed
    pub fn fail_next(&self, err: RemoteError) {
        self.script.lock().push_back(err);
    }

    /// Fail the next `n` calls with `err`
    pub fn fail_next_n(&self, n: usize, err: RemoteError) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(err.clone());
        }
    }

    /// Fail every call until cleared
    pub fn always_fail(&self, err: RemoteError) {
        *self.sticky.lock() = Some(err);
    }

    pub fn clear_failures(&self) {
        self.script.lock().clear();
        *self.sticky.lock() = None;
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Block every call until the returned notifier is signalled
    pub fn hold_calls(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once a call has entered the remote
    pub async fn wait_for_call(&self) {
        self.entered.notified().await;
    }

    /// Run `hook` with the 1-based call number at the start of every call
    pub fn on_call<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn keys(&self) -> Vec<IdempotencyKey> {
        self.calls.lock().iter().map(|call| call.key.clone()).collect()
    }

    /// Number of distinct keys the backend has committed
    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn has_applied(&self, key: &IdempotencyKey) -> bool {
        self.applied.lock().contains(key)
    }
}

#[async_trait]
impl RemoteApply for RecordingRemote {
    async fn apply(&self, operation: &Operation, key: &IdempotencyKey) -> std::result::Result<RemoteId, RemoteError> {
        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                kind: operation.kind(),
                key: key.clone(),
                operation: operation.clone(),
            });
            calls.len()
        };

        if let Some(hook) = self.hook.lock().as_ref() {
            hook(call_number);
        }
        self.entered.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        if let Some(err) = scripted.or_else(|| self.sticky.lock().clone()) {
            return Err(err);
        }

        self.applied.lock().insert(key.clone());
        Ok(RemoteId(format!("srv-{}", key)))
    }
}

/// Store wrapper whose writes or deletes can be made to fail
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
    fail_deletes: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing store, sharing its contents
    pub fn wrapping(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl DurableStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("injected write failure for {}", key)));
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("injected delete failure for {}", key)));
        }
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.inner.scan_prefix(prefix)
    }
}

/// File-backed sync harness that survives simulated restarts
pub struct TestQueue {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestQueue {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self {
            path: temp_dir.path().to_path_buf(),
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh store handle over the directory
    pub fn store(&self) -> Arc<FileStore> {
        Arc::new(FileStore::open(&self.path).expect("Failed to open file store"))
    }

    /// Open the sync subsystem over the directory, as an app start would
    pub fn open(&self, remote: Arc<RecordingRemote>, monitor: NetworkMonitor, config: SyncConfig) -> OfflineSync {
        OfflineSync::builder()
            .with_store(self.store())
            .with_remote_for_all(remote)
            .with_monitor(monitor)
            .with_config(config)
            .build()
            .expect("Failed to open offline sync")
    }
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Config with a fixed device prefix and short timings for tests
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_device_prefix("till01")
        .with_max_attempts(3)
        .with_apply_timeout(Duration::from_millis(250))
        .with_reconnect_debounce(Duration::from_millis(50))
}

/// In-memory sync subsystem wired to a recording remote
pub fn memory_sync(remote: Arc<RecordingRemote>, online: bool, config: SyncConfig) -> OfflineSync {
    OfflineSync::builder()
        .with_store(Arc::new(MemoryStore::new()))
        .with_remote_for_all(remote)
        .with_monitor(NetworkMonitor::new(online))
        .with_config(config)
        .build()
        .expect("Failed to build offline sync")
}

pub fn sample_purchase(receipt: u64) -> Operation {
    Operation::CreateTransaction(TransactionPayload {
        kind: TransactionKind::Purchase,
        material_id: "copper-bright".to_string(),
        weight_grams: 12_500,
        unit_price_cents: 720,
        total_cents: 9_000,
        customer: Some("walk-in".to_string()),
        receipt_number: Some(receipt),
        notes: None,
        occurred_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap(),
    })
}

pub fn sample_material(name: &str) -> Operation {
    Operation::CreateMaterial(MaterialPayload {
        name: name.to_string(),
        category: "non-ferrous".to_string(),
        buy_price_cents_per_kg: 300,
        sell_price_cents_per_kg: 380,
    })
}

pub fn sample_expense(amount_cents: i64) -> Operation {
    Operation::CreateExpense(ExpensePayload {
        description: "skip hire".to_string(),
        category: "logistics".to_string(),
        amount_cents,
        incurred_at: Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
    })
}

pub fn sample_order(customer: &str) -> Operation {
    Operation::CreateOrder(OrderPayload {
        customer_name: customer.to_string(),
        lines: vec![OrderLine {
            material_id: "steel-hms".to_string(),
            weight_grams: 1_000_000,
            unit_price_cents: 25,
        }],
        total_cents: 25_000,
        due_date: None,
    })
}
