//! Distribute-once barrier tests: the callbacks run once per round across
//! the fleet and never before every item reached the barrier.


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use elastic_lite::sharding::ShardingContexts;
use test_harness::{test_job_config, CountingListener, TestCluster, JOB};

#[tokio::test]
async fn test_callbacks_run_once_per_round_across_the_fleet() {
    let listener = Arc::new(CountingListener::default());
    let mut cluster = TestCluster::with_listener(3, test_job_config(9), Some(listener.clone())).await;

    let reports = cluster.execute_all().await;
    let mut executed: Vec<u32> = reports.iter().flat_map(|r| r.executed.clone()).collect();
    executed.sort_unstable();
    assert_eq!(executed, (0..9).collect::<Vec<_>>());
    assert_eq!(listener.before_count(), 1, "before_once runs on exactly one instance");
    assert_eq!(listener.after_count(), 1, "after_once runs on exactly one instance");

    // A second round releases the barrier again.
    cluster.execute_all().await;
    assert_eq!(listener.before_count(), 2);
    assert_eq!(listener.after_count(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_barrier_waits_for_every_item() {
    let listener = Arc::new(CountingListener::default());
    let mut cluster = TestCluster::with_listener(2, test_job_config(2), Some(listener.clone())).await;
    cluster.reshard().await;

    let first = cluster.node("10.0.0.1").scheduler.clone();
    let pending = tokio::spawn(async move { first.execute_once().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished(), "One instance alone cannot pass the barrier");
    assert_eq!(listener.before_count(), 0);
    assert!(cluster.node("10.0.0.1").executed_items().is_empty());

    let second = cluster.node("10.0.0.2").execute_once().await.unwrap();
    assert_eq!(second.executed, vec![1]);
    let first = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("released instance should finish")
        .unwrap()
        .unwrap();
    assert_eq!(first.executed, vec![0]);
    assert_eq!(listener.before_count(), 1);
    assert_eq!(listener.after_count(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_barrier_registration_is_cleared_after_release() {
    let listener = Arc::new(CountingListener::default());
    let mut cluster = TestCluster::with_listener(2, test_job_config(4), Some(listener)).await;

    cluster.execute_all().await;

    let guarantee = &cluster.any_node().scheduler.services().guarantee;
    assert!(!guarantee.is_all_started().await.unwrap());
    assert!(!guarantee.is_all_completed().await.unwrap());
    assert!(!guarantee.is_registered_start_success(&[0]).await.unwrap());
    assert!(!guarantee.is_registered_complete_success(&[0]).await.unwrap());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_back_to_back_listeners_each_wait_for_the_fleet() {
    let first = Arc::new(CountingListener::default());
    let second = Arc::new(CountingListener::default());
    let mut cluster =
        TestCluster::with_listeners(2, test_job_config(2), vec![first.clone(), second.clone()]).await;

    for round in 1..=3 {
        let reports = cluster.execute_all().await;
        let mut executed: Vec<u32> = reports.iter().flat_map(|r| r.executed.clone()).collect();
        executed.sort_unstable();
        assert_eq!(executed, vec![0, 1]);
        for listener in [&first, &second] {
            assert_eq!(listener.before_count(), round);
            assert_eq!(listener.after_count(), round);
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_previous_round_release_does_not_open_next_barrier() {
    let listener = CountingListener::default();
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    cluster.reshard().await;

    let node = cluster.node("10.0.0.1");
    let guarantee = &node.scheduler.services().guarantee;
    let contexts = ShardingContexts::new(
        JOB,
        node.scheduler.instance(),
        2,
        "",
        BTreeMap::from([(0, String::new())]),
        false,
    );

    // Item 1 starts elsewhere; this instance completes the first round.
    cluster
        .node("10.0.0.2")
        .scheduler
        .services()
        .guarantee
        .register_start(&[1])
        .await
        .unwrap();
    assert!(guarantee.before_job_executed(&contexts, &listener).await.unwrap());
    assert_eq!(listener.before_count(), 1);

    // Next round: item 1 never registers, so the barrier must hold.
    let next_round = tokio::time::timeout(
        Duration::from_millis(500),
        guarantee.before_job_executed(&contexts, &listener),
    )
    .await;
    assert!(next_round.is_err(), "Barrier released before every item started");
    assert_eq!(listener.before_count(), 1);

    cluster.shutdown().await;
}
