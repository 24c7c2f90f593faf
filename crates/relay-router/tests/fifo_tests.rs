//! FIFO guarantees: within a batch, within a message group, within a pool,
//! submit order equals batch order, and a mid-group failure fails the rest
//! of the group without touching other groups.

mod support;

use std::sync::Arc;
use std::time::Duration;

use relay_common::{BatchRouter, PoolConfig, RouterConfig};
use relay_router::WorkerPoolFactory;

use support::{
    batch_message, manager_with_pool_factory, pointer, wait_for, MockMediator, MockPool,
    MockPoolFactory, RecordingCallback,
};

fn config(pools: Vec<PoolConfig>) -> RouterConfig {
    RouterConfig {
        processing_pools: pools,
        queues: vec![],
        connections: None,
    }
}

// ----------------------------------------------------------------------
// S2: mid-group submit failure
// ----------------------------------------------------------------------

#[tokio::test]
async fn mid_group_failure_defers_rest_of_group_only() {
    let factory = MockPoolFactory::new();
    let pool = MockPool::new("P");
    pool.reject("m2");
    factory.register(pool.clone());

    let harness = manager_with_pool_factory(factory);
    harness
        .manager
        .reconcile(config(vec![PoolConfig::new("P", 4)]))
        .await
        .unwrap();

    let m1 = RecordingCallback::new();
    let m2 = RecordingCallback::new();
    let m3 = RecordingCallback::new();
    let x = RecordingCallback::new();

    harness
        .manager
        .route_batch(vec![
            batch_message(
                pointer("m1", "P", Some("g1")).with_broker_message_id(Some("B1".into())),
                m1.clone(),
            ),
            batch_message(
                pointer("m2", "P", Some("g1")).with_broker_message_id(Some("B2".into())),
                m2.clone(),
            ),
            batch_message(
                pointer("m3", "P", Some("g1")).with_broker_message_id(Some("B3".into())),
                m3.clone(),
            ),
            batch_message(
                pointer("x", "P", Some("g2")).with_broker_message_id(Some("B4".into())),
                x.clone(),
            ),
        ])
        .await;

    // m1 and x were submitted; m2 failed; m3 never reached the pool.
    let submitted = pool.submitted_ids();
    assert!(submitted.contains(&"m1".to_string()));
    assert!(submitted.contains(&"x".to_string()));
    assert!(!submitted.contains(&"m2".to_string()));
    assert!(!submitted.contains(&"m3".to_string()));

    assert_eq!(m2.nack_count(), 1);
    assert_eq!(m3.nack_count(), 1);
    assert_eq!(m1.terminal_count(), 0, "m1 is in flight, not terminal yet");
    assert_eq!(x.terminal_count(), 0);

    // Only the submitted messages are tracked.
    assert_eq!(harness.manager.tracker().len(), 2);
    assert!(harness.manager.tracker().is_in_flight("m1"));
    assert!(harness.manager.tracker().is_in_flight("x"));
    assert!(!harness.manager.tracker().is_in_flight("m2"));
    assert!(!harness.manager.tracker().is_in_flight("m3"));
}

// ----------------------------------------------------------------------
// Submit order within a group equals batch order
// ----------------------------------------------------------------------

#[tokio::test]
async fn submit_order_matches_batch_order_per_group() {
    let factory = MockPoolFactory::new();
    let pool = MockPool::new("P");
    factory.register(pool.clone());

    let harness = manager_with_pool_factory(factory);
    harness
        .manager
        .reconcile(config(vec![PoolConfig::new("P", 4)]))
        .await
        .unwrap();

    let mut batch = Vec::new();
    for (id, group) in [
        ("a1", "g1"),
        ("b1", "g2"),
        ("a2", "g1"),
        ("b2", "g2"),
        ("a3", "g1"),
    ] {
        batch.push(batch_message(
            pointer(id, "P", Some(group)).with_broker_message_id(Some(format!("B-{}", id))),
            RecordingCallback::new(),
        ));
    }
    harness.manager.route_batch(batch).await;

    let submitted = pool.submitted_ids();
    let g1: Vec<_> = submitted.iter().filter(|id| id.starts_with('a')).collect();
    let g2: Vec<_> = submitted.iter().filter(|id| id.starts_with('b')).collect();
    assert_eq!(g1, vec!["a1", "a2", "a3"]);
    assert_eq!(g2, vec!["b1", "b2"]);
}

// ----------------------------------------------------------------------
// End-to-end group ordering through a single-worker pool
// ----------------------------------------------------------------------

#[tokio::test]
async fn group_messages_deliver_in_order_through_real_pool() {
    let mediator = MockMediator::with_delay(Duration::from_millis(5));
    let warnings = Arc::new(relay_router::WarningService::default());
    let factory = Arc::new(WorkerPoolFactory::new(mediator.clone(), warnings));
    let harness = manager_with_pool_factory(factory);
    harness
        .manager
        .reconcile(config(vec![PoolConfig::new("P", 1)]))
        .await
        .unwrap();

    let callbacks: Vec<_> = (0..5).map(|_| RecordingCallback::new()).collect();
    let batch = callbacks
        .iter()
        .enumerate()
        .map(|(i, cb)| {
            batch_message(
                pointer(&format!("m{}", i), "P", Some("g1"))
                    .with_broker_message_id(Some(format!("B{}", i))),
                cb.clone(),
            )
        })
        .collect();
    harness.manager.route_batch(batch).await;

    assert!(
        wait_for(Duration::from_secs(5), || callbacks
            .iter()
            .all(|cb| cb.ack_count() == 1))
        .await
    );
    assert_eq!(mediator.processed_ids(), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(harness.manager.tracker().is_empty());
}

// ----------------------------------------------------------------------
// Groupless messages use the default group but do not block each other
// across pools
// ----------------------------------------------------------------------

#[tokio::test]
async fn failure_in_one_pool_leaves_other_pools_untouched() {
    let factory = MockPoolFactory::new();
    let pool_a = MockPool::new("A");
    pool_a.reject("a1");
    let pool_b = MockPool::new("B");
    factory.register(pool_a.clone());
    factory.register(pool_b.clone());

    let harness = manager_with_pool_factory(factory);
    harness
        .manager
        .reconcile(config(vec![PoolConfig::new("A", 2), PoolConfig::new("B", 2)]))
        .await
        .unwrap();

    let a1 = RecordingCallback::new();
    let a2 = RecordingCallback::new();
    let b1 = RecordingCallback::new();
    harness
        .manager
        .route_batch(vec![
            batch_message(
                pointer("a1", "A", Some("g")).with_broker_message_id(Some("BA1".into())),
                a1.clone(),
            ),
            batch_message(
                pointer("a2", "A", Some("g")).with_broker_message_id(Some("BA2".into())),
                a2.clone(),
            ),
            batch_message(
                pointer("b1", "B", Some("g")).with_broker_message_id(Some("BB1".into())),
                b1.clone(),
            ),
        ])
        .await;

    assert_eq!(a1.nack_count(), 1);
    assert_eq!(a2.nack_count(), 1, "same group in same pool fails together");
    assert!(pool_b.submitted_ids().contains(&"b1".to_string()));
    assert_eq!(b1.terminal_count(), 0);
}
