/// Idempotency key generation
///
/// Keys combine a device prefix, a persisted per-device counter, the creation
/// time and a hash of the payload:
/// ```text
/// <device>-<counter:016x>-<millis>-<sha256(kind, payload)[..16]>
/// ```
/// The counter is strictly increasing and committed before a key is handed
/// out, so keys stay unique across devices and restarts even with skewed clocks.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use reclaim_core::{DurableStore, Error, Result};

use crate::operation::Operation;

const COUNTER_KEY: &str = "idempotency#counter";
const DEVICE_KEY: &str = "idempotency#device";

/// Key identifying one logical operation across retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap an externally supplied key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.len() > 128 {
            return Err(Error::InvalidArgument(
                "idempotency key must be 1..=128 characters".to_string(),
            ));
        }
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::InvalidArgument(format!(
                "idempotency key '{}' contains invalid characters",
                key
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable hash of an operation's kind and payload, as 64 hex characters
pub fn payload_hash(operation: &Operation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.kind().as_str().as_bytes());
    hasher.update([0u8]);
    // Payload structs have a fixed field order, so the JSON encoding is canonical
    hasher.update(serde_json::to_vec(operation).unwrap_or_default());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Generates idempotency keys from a persisted per-device counter
///
/// If the store cannot be read or written, the generator keeps counting in
/// memory and retries the store on every following key. Keys stay unique for
/// the session, but a restart during such an outage may reuse counter values;
/// the timestamp and payload hash are then the only thing separating keys.
pub struct KeyGenerator {
    store: Arc<dyn DurableStore>,
    device: String,
    device_persisted: bool,
    counter: Mutex<CounterState>,
    persistent: AtomicBool,
}

struct CounterState {
    value: u64,
    /// Whether `value` has caught up with the persisted counter. Until it
    /// has, writing it back could move the stored counter backwards.
    loaded: bool,
}

impl KeyGenerator {
    /// Open a generator, resuming from the last persisted counter value
    pub fn open(store: Arc<dyn DurableStore>, device_prefix: Option<&str>) -> Self {
        let counter = match Self::load_counter(store.as_ref()) {
            Ok(value) => CounterState { value, loaded: true },
            Err(e) => {
                warn!("Idempotency counter unavailable, counting in memory: {}", e);
                CounterState { value: 0, loaded: false }
            }
        };

        let (device, device_persisted) = match device_prefix {
            Some(prefix) => (prefix.to_string(), true),
            None => match Self::load_or_create_device(store.as_ref()) {
                Ok(device) => (device, true),
                Err(e) => {
                    warn!("Device prefix could not be persisted: {}", e);
                    (Self::fresh_device(), false)
                }
            },
        };

        debug!(device = %device, counter = counter.value, "Opened idempotency key generator");

        let persistent = counter.loaded && device_persisted;
        Self {
            store,
            device,
            device_persisted,
            counter: Mutex::new(counter),
            persistent: AtomicBool::new(persistent),
        }
    }

    fn load_counter(store: &dyn DurableStore) -> Result<u64> {
        match store.get(COUNTER_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(0),
        }
    }

    fn load_or_create_device(store: &dyn DurableStore) -> Result<String> {
        if let Some(bytes) = store.get(DEVICE_KEY)? {
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let device = Self::fresh_device();
        store.put(DEVICE_KEY, Bytes::from(serde_json::to_vec(&device)?))?;
        Ok(device)
    }

    fn fresh_device() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("dev{}", &id[..8])
    }

    /// Device prefix embedded in every key
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Last counter value handed out
    pub fn counter(&self) -> u64 {
        self.counter.lock().value
    }

    /// Whether the counter is being persisted across restarts
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// Generate the key for a new operation
    pub fn generate(&self, operation: &Operation) -> IdempotencyKey {
        let hash = payload_hash(operation);
        let now = chrono::Utc::now().timestamp_millis();

        let mut counter = self.counter.lock();
        if !counter.loaded {
            if let Ok(stored) = Self::load_counter(self.store.as_ref()) {
                counter.value = counter.value.max(stored);
                counter.loaded = true;
            }
        }
        let next = counter.value + 1;

        let persisted = if counter.loaded {
            serde_json::to_vec(&next)
                .map_err(Error::from)
                .and_then(|json| self.store.put(COUNTER_KEY, Bytes::from(json)))
        } else {
            Err(Error::StoreUnavailable("idempotency counter not loaded".to_string()))
        };

        let was_persistent = self.is_persistent();
        match persisted {
            Ok(()) => {
                let now_persistent = self.device_persisted;
                if now_persistent && !was_persistent {
                    info!(counter = next, "Idempotency counter persisted again");
                }
                self.persistent.store(now_persistent, Ordering::Release);
            }
            Err(e) => {
                if was_persistent {
                    warn!("Idempotency counter persist failed, counting in memory: {}", e);
                }
                self.persistent.store(false, Ordering::Release);
            }
        }

        counter.value = next;
        IdempotencyKey(format!("{}-{:016x}-{}-{}", self.device, next, now, &hash[..16]))
    }
}
