/// Read-only projection of sync state for the UI layer
///
/// Everything here can be polled. `subscribe` additionally pushes a fresh
/// snapshot whenever the queue counts, the engine state or connectivity change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::network::NetworkStatus;
use crate::queue::{DeadLetter, LocalQueue, SyncStats};
use crate::sync_engine::{EngineState, SyncEngine};

/// Everything a status bar needs in one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub stats: SyncStats,
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub network: NetworkStatus,
}

impl SyncSnapshot {
    fn from_parts(stats: SyncStats, engine: EngineState, network: NetworkStatus) -> Self {
        Self {
            stats,
            is_syncing: engine.in_progress,
            last_sync: engine.last_sync,
            network,
        }
    }
}

#[derive(Clone)]
pub struct SyncStatus {
    queue: Arc<LocalQueue>,
    engine: SyncEngine,
    snapshot_tx: Arc<watch::Sender<SyncSnapshot>>,
    forwarding: Arc<AtomicBool>,
}

impl SyncStatus {
    pub fn new(engine: SyncEngine) -> Self {
        let queue = engine.queue().clone();
        let initial = SyncSnapshot::from_parts(
            queue.stats(),
            *engine.watch_state().borrow(),
            engine.monitor().current_status(),
        );
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            queue,
            engine,
            snapshot_tx: Arc::new(snapshot_tx),
            forwarding: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current queue counts
    pub fn stats(&self) -> SyncStats {
        self.queue.stats()
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.engine.is_sync_in_progress()
    }

    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        self.engine.last_sync_timestamp()
    }

    /// Items retired into the dead set, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters()
    }

    /// Assemble a snapshot from the live components
    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            stats: self.queue.stats(),
            is_syncing: self.engine.is_sync_in_progress(),
            last_sync: self.engine.last_sync_timestamp(),
            network: self.engine.monitor().current_status(),
        }
    }

    /// Receive a snapshot on every change.
    ///
    /// Pushing needs a tokio runtime; without one the receiver only ever
    /// holds the snapshot taken at subscription time.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_tx.send_replace(self.snapshot());
        let rx = self.snapshot_tx.subscribe();
        self.ensure_forwarding();
        rx
    }

    fn ensure_forwarding(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.forwarding.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut stats_rx = self.queue.subscribe_stats();
        let mut state_rx = self.engine.watch_state();
        let mut network_rx = self.engine.monitor().watch();
        let snapshot_tx = self.snapshot_tx.clone();
        let forwarding = self.forwarding.clone();

        handle.spawn(async move {
            loop {
                let changed = tokio::select! {
                    r = stats_rx.changed() => r,
                    r = state_rx.changed() => r,
                    r = network_rx.changed() => r,
                };
                if changed.is_err() {
                    break;
                }

                let snapshot = SyncSnapshot::from_parts(
                    *stats_rx.borrow_and_update(),
                    *state_rx.borrow_and_update(),
                    *network_rx.borrow_and_update(),
                );
                snapshot_tx.send_if_modified(|current| {
                    if *current == snapshot {
                        false
                    } else {
                        *current = snapshot;
                        true
                    }
                });
            }
            forwarding.store(false, Ordering::Release);
            debug!("Status forwarder exited");
        });
    }
}
