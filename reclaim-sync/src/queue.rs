/// Local durable queue of pending mutations
///
/// Owns the lifecycle of every queued item. Each mutating call commits to the
/// durable store before it updates the in-memory index and before it returns,
/// so a crash right after `enqueue` never loses an accepted mutation.
///
/// Record layout in the store:
/// ```text
/// queue#seq                 last assigned item id
/// queue#item#<id:020>       active QueueItem (Pending, Processing, Failed)
/// queue#dead#<id:020>       DeadLetter
/// ledger#keys               ProcessedKeyLedger, oldest first
/// ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use reclaim_core::{DurableStore, Error, Result, SyncConfig};

use crate::idempotency::{IdempotencyKey, KeyGenerator};
use crate::ledger::{PersistedLedger, ProcessedKeyLedger};
use crate::operation::{Operation, OperationKind};

const SEQ_KEY: &str = "queue#seq";
const ITEM_PREFIX: &str = "queue#item#";
const DEAD_PREFIX: &str = "queue#dead#";
const LEDGER_KEY: &str = "ledger#keys";

/// Identifier of a queued item; ids increase in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueItemId(pub u64);

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ItemStatus {
    /// Whether the item still awaits remote application
    pub fn is_active(&self) -> bool {
        !matches!(self, ItemStatus::Success)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One locally-originated mutation awaiting remote application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub idempotency_key: IdempotencyKey,
    pub operation: Operation,
    pub status: ItemStatus,
    /// Remote-apply attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error from the last failed attempt
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn operation_type(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// Why an item was retired into the dead set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// Transient failures reached the attempt limit
    RetriesExhausted,
    /// The remote rejected the operation permanently
    Rejected,
}

impl fmt::Display for DeadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadReason::RetriesExhausted => f.write_str("retries exhausted"),
            DeadReason::Rejected => f.write_str("rejected"),
        }
    }
}

/// A permanently failed item kept for manual inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: DeadReason,
    pub error: String,
    pub retired_at: DateTime<Utc>,
}

/// Queue counts, recomputed from the current items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    /// Items still in the active queue (pending + processing + failed)
    pub total: usize,
    /// Items retired into the dead set
    pub dead: usize,
}

struct QueueState {
    items: BTreeMap<QueueItemId, QueueItem>,
    by_key: HashMap<IdempotencyKey, QueueItemId>,
    dead: BTreeMap<QueueItemId, DeadLetter>,
    /// Keys held by dead letters; a retired key is never queued a second time
    dead_by_key: HashMap<IdempotencyKey, QueueItemId>,
    ledger: ProcessedKeyLedger,
    next_id: u64,
}

impl QueueState {
    fn stats(&self) -> SyncStats {
        let mut stats = SyncStats {
            dead: self.dead.len(),
            ..SyncStats::default()
        };
        for item in self.items.values() {
            match item.status {
                ItemStatus::Pending => stats.pending += 1,
                ItemStatus::Processing => stats.processing += 1,
                ItemStatus::Failed => stats.failed += 1,
                ItemStatus::Success => continue,
            }
            stats.total += 1;
        }
        stats
    }

    fn item_mut(&mut self, id: QueueItemId) -> Result<&mut QueueItem> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("queue item {}", id)))
    }
}

/// Persisted, ordered queue of pending mutations
pub struct LocalQueue {
    store: Arc<dyn DurableStore>,
    keys: KeyGenerator,
    state: RwLock<QueueState>,
    stats_tx: watch::Sender<SyncStats>,
}

impl LocalQueue {
    /// Open the queue, loading every persisted item, dead letter and ledger key.
    ///
    /// Items left `Processing` by a crash are restored as `Pending`: the remote
    /// outcome of their last attempt is unknown, so they are retried.
    pub fn open(store: Arc<dyn DurableStore>, config: &SyncConfig) -> Result<Self> {
        config.validate()?;

        let keys = KeyGenerator::open(store.clone(), config.device_prefix.as_deref());

        let mut items = BTreeMap::new();
        for (_, bytes) in store.scan_prefix(ITEM_PREFIX)? {
            let mut item: QueueItem = serde_json::from_slice(&bytes)?;
            if item.status == ItemStatus::Processing {
                warn!(id = %item.id, key = %item.idempotency_key, "Recovering item interrupted mid-apply");
                item.status = ItemStatus::Pending;
                store.put(&item_record_key(item.id), Bytes::from(serde_json::to_vec(&item)?))?;
            }
            items.insert(item.id, item);
        }

        let mut dead = BTreeMap::new();
        for (_, bytes) in store.scan_prefix(DEAD_PREFIX)? {
            let letter: DeadLetter = serde_json::from_slice(&bytes)?;
            dead.insert(letter.item.id, letter);
        }

        let by_key: HashMap<IdempotencyKey, QueueItemId> = items
            .values()
            .map(|item| (item.idempotency_key.clone(), item.id))
            .collect();
        let dead_by_key = dead
            .values()
            .map(|letter| (letter.item.idempotency_key.clone(), letter.item.id))
            .collect();

        let ledger = match store.get(LEDGER_KEY)? {
            Some(bytes) => {
                let persisted: PersistedLedger = serde_json::from_slice(&bytes)?;
                let restored = persisted.keys.len();
                let ledger = ProcessedKeyLedger::from_keys(persisted.keys, config.ledger_capacity, |k| {
                    by_key.contains_key(k)
                });
                if ledger.len() < restored {
                    debug!(evicted = restored - ledger.len(), "Trimmed processed ledger on open");
                }
                ledger
            }
            None => ProcessedKeyLedger::new(config.ledger_capacity),
        };

        let persisted_seq: u64 = match store.get(SEQ_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => 0,
        };
        let max_seen = items
            .keys()
            .chain(dead.keys())
            .map(|id| id.0)
            .max()
            .unwrap_or(0);

        let state = QueueState {
            items,
            by_key,
            dead,
            dead_by_key,
            ledger,
            next_id: persisted_seq.max(max_seen) + 1,
        };

        let stats = state.stats();
        info!(
            pending = stats.pending,
            failed = stats.failed,
            dead = stats.dead,
            "Opened local queue"
        );

        let (stats_tx, _) = watch::channel(stats);

        Ok(Self {
            store,
            keys,
            state: RwLock::new(state),
            stats_tx,
        })
    }

    /// Queue a new mutation under a freshly generated idempotency key
    pub fn enqueue(&self, operation: Operation) -> Result<QueueItem> {
        operation.validate()?;
        let key = self.keys.generate(&operation);
        self.enqueue_with_key(operation, key)
    }

    /// Queue a mutation under a caller-supplied idempotency key.
    ///
    /// If an active item already holds the key, that item is returned and
    /// nothing new is queued. A key held by a dead letter is rejected; the
    /// dead item has to be requeued instead.
    pub fn enqueue_with_key(&self, operation: Operation, key: IdempotencyKey) -> Result<QueueItem> {
        operation.validate()?;

        let mut state = self.state.write();

        if let Some(existing) = state.by_key.get(&key).and_then(|id| state.items.get(id)) {
            debug!(id = %existing.id, key = %key, "Duplicate enqueue, returning existing item");
            return Ok(existing.clone());
        }
        if let Some(dead_id) = state.dead_by_key.get(&key) {
            return Err(Error::InvalidArgument(format!(
                "key {} belongs to dead item {}; requeue it instead",
                key, dead_id
            )));
        }

        let id = QueueItemId(state.next_id);
        let item = QueueItem {
            id,
            idempotency_key: key,
            operation,
            status: ItemStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
        };

        self.store
            .put(SEQ_KEY, Bytes::from(serde_json::to_vec(&id.0)?))
            .map_err(|e| e.with_context("enqueue"))?;
        self.persist_item(&item).map_err(|e| e.with_context("enqueue"))?;

        state.next_id += 1;
        state.by_key.insert(item.idempotency_key.clone(), id);
        state.items.insert(id, item.clone());

        debug!(id = %id, key = %item.idempotency_key, kind = %item.operation_type(), "Enqueued operation");
        self.publish(&state);
        Ok(item)
    }

    /// Get an active item by id
    pub fn get(&self, id: QueueItemId) -> Option<QueueItem> {
        self.state.read().items.get(&id).cloned()
    }

    /// Items awaiting a drain (Pending or Failed), oldest first.
    ///
    /// Returns a snapshot; items enqueued afterwards are not included.
    pub fn list_pending(&self) -> impl Iterator<Item = QueueItem> {
        let state = self.state.read();
        let snapshot: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| matches!(item.status, ItemStatus::Pending | ItemStatus::Failed))
            .cloned()
            .collect();
        snapshot.into_iter()
    }

    /// All active items regardless of status, oldest first
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.read().items.values().cloned().collect()
    }

    /// Begin a remote-apply attempt: Pending/Failed → Processing.
    ///
    /// Increments `attempts` and stamps `last_attempt_at`.
    pub fn mark_processing(&self, id: QueueItemId) -> Result<QueueItem> {
        let mut state = self.state.write();
        let current = state.item_mut(id)?.clone();

        if !matches!(current.status, ItemStatus::Pending | ItemStatus::Failed) {
            return Err(Error::InvalidArgument(format!(
                "queue item {} is {} and cannot start processing",
                id, current.status
            )));
        }

        let mut updated = current;
        updated.status = ItemStatus::Processing;
        updated.attempts += 1;
        updated.last_attempt_at = Some(Utc::now());

        self.persist_item(&updated)?;
        *state.item_mut(id)? = updated.clone();

        self.publish(&state);
        Ok(updated)
    }

    /// Record a remote success: the key enters the ledger and the item leaves
    /// the active queue.
    ///
    /// The ledger is committed first. If the process dies before the item
    /// record is removed, the item comes back as Pending with its key already
    /// in the ledger and is settled without another remote call.
    pub fn mark_success(&self, id: QueueItemId) -> Result<()> {
        let mut state = self.state.write();
        let key = state.item_mut(id)?.idempotency_key.clone();

        let mut ledger = state.ledger.clone();
        let evicted = {
            let by_key = &state.by_key;
            ledger.insert(key.clone(), |k| *k != key && by_key.contains_key(k))
        };
        self.persist_ledger(&ledger)?;
        state.ledger = ledger;

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted oldest keys from processed ledger");
        }

        self.store.delete(&item_record_key(id))?;
        state.items.remove(&id);
        state.by_key.remove(&key);

        debug!(id = %id, key = %key, "Item applied remotely");
        self.publish(&state);
        Ok(())
    }

    /// Record a failed attempt; the item stays queued for the next drain
    pub fn mark_failed(&self, id: QueueItemId, reason: impl Into<String>) -> Result<QueueItem> {
        let mut state = self.state.write();

        let mut updated = state.item_mut(id)?.clone();
        updated.status = ItemStatus::Failed;
        updated.last_error = Some(reason.into());

        self.persist_item(&updated)?;
        *state.item_mut(id)? = updated.clone();

        self.publish(&state);
        Ok(updated)
    }

    /// Record an attempt cut short by lost connectivity.
    ///
    /// Like `mark_failed`, but the attempt taken by `mark_processing` is given
    /// back so connectivity loss never counts toward the retry bound.
    pub fn mark_interrupted(&self, id: QueueItemId, reason: impl Into<String>) -> Result<QueueItem> {
        let mut state = self.state.write();

        let mut updated = state.item_mut(id)?.clone();
        if updated.status == ItemStatus::Processing {
            updated.attempts = updated.attempts.saturating_sub(1);
        }
        updated.status = ItemStatus::Failed;
        updated.last_error = Some(reason.into());

        self.persist_item(&updated)?;
        *state.item_mut(id)? = updated.clone();

        self.publish(&state);
        Ok(updated)
    }

    /// Move an item out of the active queue into the dead set
    pub fn retire(&self, id: QueueItemId, reason: DeadReason, error: impl Into<String>) -> Result<DeadLetter> {
        let mut state = self.state.write();

        let mut item = state.item_mut(id)?.clone();
        let error = error.into();
        item.status = ItemStatus::Failed;
        item.last_error = Some(error.clone());

        let letter = DeadLetter {
            item,
            reason,
            error,
            retired_at: Utc::now(),
        };

        self.store.put(
            &dead_record_key(id),
            Bytes::from(serde_json::to_vec(&letter)?),
        )?;
        self.store.delete(&item_record_key(id))?;

        state.items.remove(&id);
        state.by_key.remove(&letter.item.idempotency_key);
        state.dead_by_key.insert(letter.item.idempotency_key.clone(), id);
        state.dead.insert(id, letter.clone());

        warn!(
            id = %id,
            key = %letter.item.idempotency_key,
            attempts = letter.item.attempts,
            reason = %reason,
            "Retired item to dead set: {}",
            letter.error
        );
        self.publish(&state);
        Ok(letter)
    }

    /// Items retired into the dead set, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.read().dead.values().cloned().collect()
    }

    /// Put a dead item back into the active queue with its attempts reset
    pub fn requeue_dead(&self, id: QueueItemId) -> Result<QueueItem> {
        let mut state = self.state.write();

        let letter = state
            .dead
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("dead letter {}", id)))?;

        if state.by_key.contains_key(&letter.item.idempotency_key) {
            return Err(Error::InvalidArgument(format!(
                "key {} is already queued",
                letter.item.idempotency_key
            )));
        }

        let mut item = letter.item;
        item.status = ItemStatus::Pending;
        item.attempts = 0;
        item.last_error = None;

        self.persist_item(&item)?;
        self.store.delete(&dead_record_key(id))?;

        state.dead.remove(&id);
        state.dead_by_key.remove(&item.idempotency_key);
        state.by_key.insert(item.idempotency_key.clone(), id);
        state.items.insert(id, item.clone());

        info!(id = %id, "Requeued dead item");
        self.publish(&state);
        Ok(item)
    }

    /// Permanently drop a dead item
    pub fn discard_dead(&self, id: QueueItemId) -> Result<DeadLetter> {
        let mut state = self.state.write();

        if !state.dead.contains_key(&id) {
            return Err(Error::NotFound(format!("dead letter {}", id)));
        }
        self.store.delete(&dead_record_key(id))?;

        let letter = state
            .dead
            .remove(&id)
            .ok_or_else(|| Error::Internal(format!("dead letter {} vanished", id)))?;
        state.dead_by_key.remove(&letter.item.idempotency_key);

        info!(id = %id, "Discarded dead item");
        self.publish(&state);
        Ok(letter)
    }

    /// Check whether a key is recorded as applied remotely
    pub fn ledger_contains(&self, key: &IdempotencyKey) -> bool {
        self.state.read().ledger.contains(key)
    }

    /// Record a key as applied without going through an item.
    ///
    /// Used when the backend confirms an operation out of band, and by tests
    /// to reproduce a crash between remote success and local commit.
    pub fn record_processed_key(&self, key: IdempotencyKey) -> Result<()> {
        let mut state = self.state.write();

        let mut ledger = state.ledger.clone();
        {
            let by_key = &state.by_key;
            ledger.insert(key, |k| by_key.contains_key(k));
        }
        self.persist_ledger(&ledger)?;
        state.ledger = ledger;
        Ok(())
    }

    /// Current queue counts
    pub fn stats(&self) -> SyncStats {
        self.state.read().stats()
    }

    /// Receive queue counts every time they change
    pub fn subscribe_stats(&self) -> watch::Receiver<SyncStats> {
        self.stats_tx.subscribe()
    }

    /// Idempotency key generator backing this queue
    pub fn key_generator(&self) -> &KeyGenerator {
        &self.keys
    }

    /// Durable store backing this queue
    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Number of active items
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    fn persist_item(&self, item: &QueueItem) -> Result<()> {
        self.store
            .put(&item_record_key(item.id), Bytes::from(serde_json::to_vec(item)?))
    }

    fn persist_ledger(&self, ledger: &ProcessedKeyLedger) -> Result<()> {
        self.store
            .put(LEDGER_KEY, Bytes::from(serde_json::to_vec(&ledger.to_persisted())?))
    }

    fn publish(&self, state: &QueueState) {
        self.stats_tx.send_replace(state.stats());
    }
}

fn item_record_key(id: QueueItemId) -> String {
    format!("{}{:020}", ITEM_PREFIX, id.0)
}

fn dead_record_key(id: QueueItemId) -> String {
    format!("{}{:020}", DEAD_PREFIX, id.0)
}
