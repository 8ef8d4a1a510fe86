/// End-to-end behaviour of the offline queue and sync engine
///
/// Each test drives the public `OfflineSync` surface against a recording
/// remote and checks the observable queue state afterwards.

use reclaim_core::SyncConfig;
use reclaim_sync::{
    DeadReason, IdempotencyKey, ItemOutcome, ItemStatus, OperationKind, RemoteError, SyncOutcome,
    NETWORK_LOST_REASON,
};
use reclaim_test_utils::{
    memory_sync, sample_expense, sample_material, sample_order, sample_purchase, test_config,
    RecordingRemote,
};
use std::time::Duration;

#[tokio::test]
async fn test_total_counts_only_active_items() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    for n in 0..5 {
        sync.enqueue(sample_purchase(n)).unwrap();
        let stats = sync.stats();
        assert_eq!(stats.total, stats.pending + stats.processing + stats.failed);
    }
    assert_eq!(sync.stats().total, 5);

    // First attempt fails and stays counted
    remote.fail_next(RemoteError::Transient("502".into()));
    let first = sync.queue().list_pending().next().unwrap();
    sync.engine().process_item(first.id).await;

    let stats = sync.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total, 5);

    sync.force_sync().await;
    let stats = sync.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.total, stats.pending + stats.processing + stats.failed);
}

#[tokio::test]
async fn test_drain_preserves_fifo_across_kinds() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    let a = sync.enqueue(sample_material("copper")).unwrap();
    let b = sync.enqueue(sample_purchase(1)).unwrap();
    let c = sync.enqueue(sample_order("Harbour Metals")).unwrap();
    let d = sync.enqueue(sample_expense(2_500)).unwrap();

    let outcome = sync.force_sync().await;
    assert_eq!(outcome, SyncOutcome { success: 4, failed: 0, retired: 0 });

    let keys = remote.keys();
    assert_eq!(
        keys,
        vec![a.idempotency_key, b.idempotency_key, c.idempotency_key, d.idempotency_key]
    );
    let kinds: Vec<_> = remote.calls().iter().map(|call| call.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::CreateMaterial,
            OperationKind::CreateTransaction,
            OperationKind::CreateOrder,
            OperationKind::CreateExpense,
        ]
    );
}

#[tokio::test]
async fn test_process_item_twice_reaches_remote_once() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());
    let item = sync.enqueue(sample_purchase(7)).unwrap();

    let (first, second) = tokio::join!(
        sync.engine().process_item(item.id),
        sync.engine().process_item(item.id)
    );

    let applied = [&first, &second]
        .iter()
        .filter(|outcome| matches!(outcome, ItemOutcome::Applied(_)))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(remote.call_count(), 1);

    assert_eq!(sync.engine().process_item(item.id).await, ItemOutcome::Skipped);
    assert_eq!(remote.call_count(), 1);
}

#[tokio::test]
async fn test_colliding_keys_apply_once() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());
    let key = IdempotencyKey::new("till01-collision").unwrap();

    // Collision while the first item is still queued
    let first = sync.enqueue_with_key(sample_material("lead"), key.clone()).unwrap();
    let second = sync.enqueue_with_key(sample_material("zinc"), key.clone()).unwrap();
    assert_eq!(first.id, second.id);

    sync.force_sync().await;
    assert_eq!(remote.call_count(), 1);

    // Collision after the first item was applied
    let third = sync.enqueue_with_key(sample_material("tin"), key.clone()).unwrap();
    assert_ne!(third.id, first.id);

    let outcome = sync.force_sync().await;
    assert_eq!(outcome.success, 1);
    assert_eq!(remote.call_count(), 1);
    assert_eq!(sync.stats().total, 0);
}

#[tokio::test]
async fn test_key_held_by_dead_item_is_not_queued_twice() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());
    let key = IdempotencyKey::new("till01-r42").unwrap();

    remote.fail_next(RemoteError::Permanent("422 unknown material".into()));
    let rejected = sync.enqueue_with_key(sample_material("lead"), key.clone()).unwrap();
    sync.force_sync().await;
    assert_eq!(sync.stats().dead, 1);

    let result = sync.enqueue_with_key(sample_material("lead"), key.clone());
    assert!(matches!(result, Err(reclaim_core::Error::InvalidArgument(_))));
    assert_eq!(sync.stats().total, 0);

    let requeued = sync.queue().requeue_dead(rejected.id).unwrap();
    assert_eq!(requeued.idempotency_key, key);
    assert_eq!(sync.force_sync().await.success, 1);
    assert_eq!(remote.applied_count(), 1);
}

#[tokio::test]
async fn test_always_failing_item_retires_after_max_attempts() {
    let remote = RecordingRemote::new();
    let config = test_config().with_max_attempts(5);
    let sync = memory_sync(remote.clone(), true, config);
    remote.always_fail(RemoteError::Transient("503 service unavailable".into()));

    let item = sync.enqueue(sample_purchase(1)).unwrap();

    for pass in 1..=4 {
        let outcome = sync.force_sync().await;
        assert_eq!(outcome, SyncOutcome { success: 0, failed: 1, retired: 0 });
        let queued = sync.queue().get(item.id).unwrap();
        assert_eq!(queued.attempts, pass);
        assert_eq!(queued.status, ItemStatus::Failed);
    }

    let fifth = sync.force_sync().await;
    assert_eq!(fifth.retired, 1);
    assert!(sync.queue().get(item.id).is_none());

    let dead = sync.status().dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadReason::RetriesExhausted);
    assert_eq!(dead[0].item.attempts, 5);

    for _ in 0..3 {
        assert_eq!(sync.force_sync().await, SyncOutcome::default());
    }
    assert_eq!(remote.call_count(), 5);
    assert_eq!(sync.stats().dead, 1);
    assert_eq!(sync.stats().total, 0);
}

#[tokio::test]
async fn test_permanent_rejection_goes_straight_to_dead_set() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    remote.fail_next(RemoteError::Permanent("422 unknown material".into()));
    let rejected = sync.enqueue(sample_purchase(1)).unwrap();
    sync.enqueue(sample_purchase(2)).unwrap();

    let outcome = sync.force_sync().await;
    assert_eq!(outcome, SyncOutcome { success: 1, failed: 1, retired: 1 });

    let dead = sync.status().dead_letters();
    assert_eq!(dead[0].item.id, rejected.id);
    assert_eq!(dead[0].reason, DeadReason::Rejected);
    assert_eq!(dead[0].item.attempts, 1);
}

#[tokio::test]
async fn test_requeued_dead_item_is_retried() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    remote.fail_next(RemoteError::Permanent("409 price list locked".into()));
    let item = sync.enqueue(sample_material("brass")).unwrap();
    sync.force_sync().await;
    assert_eq!(sync.stats().dead, 1);

    sync.queue().requeue_dead(item.id).unwrap();
    let outcome = sync.force_sync().await;
    assert_eq!(outcome.success, 1);
    assert!(remote.has_applied(&item.idempotency_key));
    assert_eq!(sync.stats().dead, 0);
}

#[tokio::test]
async fn test_preseeded_ledger_skips_remote_call() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    let item = sync.enqueue(sample_purchase(3)).unwrap();
    sync.queue().record_processed_key(item.idempotency_key.clone()).unwrap();
    assert_eq!(sync.queue().get(item.id).unwrap().status, ItemStatus::Pending);

    let outcome = sync.force_sync().await;
    assert_eq!(outcome.success, 1);
    assert_eq!(remote.call_count(), 0);
    assert!(sync.queue().get(item.id).is_none());
}

#[tokio::test]
async fn test_second_force_sync_is_a_no_op_while_draining() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());
    for n in 0..3 {
        sync.enqueue(sample_purchase(n)).unwrap();
    }

    let gate = remote.hold_calls();
    let first = tokio::spawn({
        let sync = sync.clone();
        async move { sync.force_sync().await }
    });

    remote.wait_for_call().await;
    assert!(sync.is_sync_in_progress());
    assert!(sync.status().snapshot().is_syncing);

    let second = sync.force_sync().await;
    assert_eq!(second, SyncOutcome::default());

    let releaser = tokio::spawn({
        let gate = gate.clone();
        async move {
            loop {
                gate.notify_one();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    let outcome = first.await.unwrap();
    releaser.abort();

    assert_eq!(outcome.success, 3);
    assert_eq!(remote.call_count(), 3);
    assert_eq!(remote.applied_count(), 3);
    assert!(!sync.is_sync_in_progress());
}

#[tokio::test]
async fn test_slow_remote_times_out_without_hanging_drain() {
    let remote = RecordingRemote::new();
    remote.set_delay(Duration::from_secs(10));
    let config = test_config().with_apply_timeout(Duration::from_millis(50));
    let sync = memory_sync(remote.clone(), true, config);

    sync.enqueue(sample_purchase(1)).unwrap();
    sync.enqueue(sample_purchase(2)).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), sync.force_sync())
        .await
        .expect("drain must not hang on a slow remote");
    assert_eq!(outcome, SyncOutcome { success: 0, failed: 2, retired: 0 });

    for item in sync.queue().items() {
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.last_error.unwrap().contains("timed out"));
    }
}

#[tokio::test]
async fn test_connectivity_loss_halts_remaining_items() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());
    let items: Vec<_> = (0..4).map(|n| sync.enqueue(sample_purchase(n)).unwrap()).collect();

    // Connectivity drops while the second item is in flight
    let monitor = sync.monitor().clone();
    remote.on_call(move |call| {
        if call == 2 {
            monitor.observe(false);
        }
    });

    let outcome = sync.force_sync().await;
    assert_eq!(outcome.success, 2);
    assert_eq!(outcome.failed, 2);
    assert_eq!(remote.call_count(), 2);

    for item in &items[2..] {
        let halted = sync.queue().get(item.id).unwrap();
        assert_eq!(halted.status, ItemStatus::Failed);
        assert_eq!(halted.attempts, 0);
        assert_eq!(halted.last_error.as_deref(), Some(NETWORK_LOST_REASON));
    }

    // Offline drains do nothing
    assert_eq!(sync.force_sync().await, SyncOutcome::default());

    sync.monitor().observe(true);
    let resumed = sync.force_sync().await;
    assert_eq!(resumed.success, 2);
    assert_eq!(sync.stats().total, 0);
}

#[tokio::test]
async fn test_network_lost_on_last_attempt_halts_pass_without_retiring() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), true, test_config());

    // Two of the three allowed attempts are already used
    let first = sync.enqueue(sample_purchase(1)).unwrap();
    remote.fail_next_n(2, RemoteError::Transient("502".into()));
    sync.engine().process_item(first.id).await;
    sync.engine().process_item(first.id).await;
    assert_eq!(sync.queue().get(first.id).unwrap().attempts, 2);

    let rest: Vec<_> = (2..4).map(|n| sync.enqueue(sample_purchase(n)).unwrap()).collect();

    remote.fail_next(RemoteError::NetworkLost("connection reset".into()));
    let outcome = sync.force_sync().await;
    assert_eq!(outcome, SyncOutcome { success: 0, failed: 3, retired: 0 });
    assert_eq!(remote.call_count(), 3);
    assert!(sync.status().dead_letters().is_empty());

    let interrupted = sync.queue().get(first.id).unwrap();
    assert_eq!(interrupted.status, ItemStatus::Failed);
    assert_eq!(interrupted.attempts, 2);

    for item in &rest {
        let halted = sync.queue().get(item.id).unwrap();
        assert_eq!(halted.attempts, 0);
        assert_eq!(halted.last_error.as_deref(), Some(NETWORK_LOST_REASON));
    }

    let resumed = sync.force_sync().await;
    assert_eq!(resumed.success, 3);
    assert_eq!(remote.call_count(), 6);
}

#[tokio::test]
async fn test_enqueue_works_offline() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote.clone(), false, test_config());

    for n in 0..3 {
        sync.enqueue(sample_expense(100 + n)).unwrap();
    }
    assert_eq!(sync.stats().pending, 3);
    assert_eq!(sync.force_sync().await, SyncOutcome::default());
    assert_eq!(remote.call_count(), 0);
    assert!(sync.status().last_sync_timestamp().is_none());
}

#[tokio::test]
async fn test_generated_keys_are_unique_and_prefixed() {
    let remote = RecordingRemote::new();
    let sync = memory_sync(remote, false, SyncConfig::new().with_device_prefix("scale2"));

    let mut keys = std::collections::HashSet::new();
    for _ in 0..50 {
        // Identical payloads still get distinct keys
        let item = sync.enqueue(sample_expense(999)).unwrap();
        assert!(item.idempotency_key.as_str().starts_with("scale2-"));
        assert!(keys.insert(item.idempotency_key));
    }
}
