/// Remote apply seam
///
/// The sync engine never talks to the backend directly: each operation kind is
/// routed to a `RemoteApply` implementation registered in a `RemoteRegistry`.
/// Delivery is at-least-once to the wire and effectively-once as observed by
/// the client, since the processed-key ledger suppresses known duplicates but
/// an ambiguous failure (e.g. a timeout after the backend committed) is retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::idempotency::IdempotencyKey;
use crate::operation::{Operation, OperationKind};

#[cfg(feature = "http-sync")]
pub mod http;

/// Identifier assigned by the backend to an applied operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure of a remote-apply call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or server-side failure; retry on the next drain
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The backend rejected the operation; retrying cannot succeed
    #[error("permanent remote error: {0}")]
    Permanent(String),

    /// The call did not finish within the configured bound
    #[error("remote apply timed out after {0:?}")]
    Timeout(Duration),

    /// Connectivity dropped during the call
    #[error("network lost: {0}")]
    NetworkLost(String),
}

impl RemoteError {
    /// Timeouts and network loss are treated like any transient failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Permanent(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::Transient(_) => "REMOTE_TRANSIENT",
            RemoteError::Permanent(_) => "REMOTE_PERMANENT",
            RemoteError::Timeout(_) => "REMOTE_TIMEOUT",
            RemoteError::NetworkLost(_) => "NETWORK_LOST",
        }
    }
}

/// Applies one queued operation against the remote store
#[async_trait]
pub trait RemoteApply: Send + Sync {
    /// Apply the operation. The key should be forwarded so the backend can
    /// deduplicate retries of an ambiguous failure.
    async fn apply(&self, operation: &Operation, key: &IdempotencyKey) -> Result<RemoteId, RemoteError>;
}

/// Routes each operation kind to its remote applier
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    appliers: HashMap<OperationKind, Arc<dyn RemoteApply>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an applier for one kind, replacing any previous one
    pub fn register(mut self, kind: OperationKind, applier: Arc<dyn RemoteApply>) -> Self {
        self.appliers.insert(kind, applier);
        self
    }

    /// Register the same applier for every kind
    pub fn register_all(mut self, applier: Arc<dyn RemoteApply>) -> Self {
        for kind in OperationKind::ALL {
            self.appliers.insert(kind, applier.clone());
        }
        self
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Arc<dyn RemoteApply>> {
        self.appliers.get(&kind)
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.appliers.contains_key(&kind)
    }

    /// Apply through the registered applier.
    ///
    /// An unregistered kind can never be applied, so it fails permanently.
    pub async fn apply(&self, operation: &Operation, key: &IdempotencyKey) -> Result<RemoteId, RemoteError> {
        match self.appliers.get(&operation.kind()) {
            Some(applier) => applier.apply(operation, key).await,
            None => Err(RemoteError::Permanent(format!(
                "no remote applier registered for {}",
                operation.kind()
            ))),
        }
    }
}
