/// Processed-key ledger
///
/// Bounded, insertion-ordered set of idempotency keys known to have been
/// applied remotely. Membership is a hash lookup; eviction removes the oldest
/// key first but skips keys whose operation is still active in the queue.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::idempotency::IdempotencyKey;

/// Default number of keys retained
pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct ProcessedKeyLedger {
    order: VecDeque<IdempotencyKey>,
    members: HashSet<IdempotencyKey>,
    capacity: usize,
}

impl ProcessedKeyLedger {
    /// Create an empty ledger
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild a ledger from its persisted key list, oldest first.
    ///
    /// The persisted list may hold more keys than `capacity`, either because
    /// active keys kept it above the bound or because the bound was lowered.
    /// Trimming only evicts keys `is_active` reports as settled.
    pub fn from_keys<F>(keys: Vec<IdempotencyKey>, capacity: usize, is_active: F) -> Self
    where
        F: Fn(&IdempotencyKey) -> bool,
    {
        let mut ledger = Self::new(capacity);
        for key in keys {
            if ledger.members.insert(key.clone()) {
                ledger.order.push_back(key);
            }
        }
        ledger.evict_inactive(&is_active, ledger.order.len());
        ledger
    }

    /// Check whether a key has been applied
    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        self.members.contains(key)
    }

    /// Record a key as applied.
    ///
    /// `is_active` reports keys that still belong to a Pending or Processing
    /// item; those are never evicted, even if that leaves the ledger above
    /// capacity until the item settles. Returns the evicted keys.
    pub fn insert<F>(&mut self, key: IdempotencyKey, is_active: F) -> Vec<IdempotencyKey>
    where
        F: Fn(&IdempotencyKey) -> bool,
    {
        if !self.members.insert(key.clone()) {
            return Vec::new();
        }
        self.order.push_back(key);

        // The key just recorded sits at the back and is never a candidate
        let candidates = self.order.len() - 1;
        self.evict_inactive(&is_active, candidates)
    }

    /// Evict the oldest inactive keys among the first `candidates` until the
    /// ledger is back within capacity
    fn evict_inactive<F>(&mut self, is_active: &F, candidates: usize) -> Vec<IdempotencyKey>
    where
        F: Fn(&IdempotencyKey) -> bool,
    {
        let mut evicted = Vec::new();
        let mut index = 0;
        let mut remaining = candidates;
        while self.order.len() > self.capacity && remaining > 0 {
            remaining -= 1;
            if is_active(&self.order[index]) {
                index += 1;
                continue;
            }
            if let Some(old) = self.order.remove(index) {
                self.members.remove(&old);
                evicted.push(old);
            }
        }
        evicted
    }

    /// Keys in insertion order, oldest first
    pub fn keys(&self) -> impl Iterator<Item = &IdempotencyKey> {
        self.order.iter()
    }

    /// Snapshot for persistence
    pub fn to_persisted(&self) -> PersistedLedger {
        PersistedLedger {
            keys: self.order.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ProcessedKeyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

/// On-disk form of the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedLedger {
    pub keys: Vec<IdempotencyKey>,
}
