//! Sharding tests: assignment over the fleet, resharding on topology
//! changes and static assignments.


use std::time::Duration;

use elastic_lite::storage::path;
use elastic_lite::topology::ServerStatus;
use test_harness::{assert_eventually, test_job_config, TestCluster};

#[tokio::test]
async fn test_nine_items_split_evenly_over_three_instances() {
    let mut cluster = TestCluster::new(3, test_job_config(9)).await;
    assert!(cluster.is_need_sharding().await, "Start-up should request sharding");

    cluster.reshard().await;
    assert!(!cluster.is_need_sharding().await);

    let by_instance = cluster.items_by_instance().await;
    assert_eq!(
        by_instance.get(&cluster.node("10.0.0.1").instance_id()),
        Some(&vec![0, 1, 2])
    );
    assert_eq!(
        by_instance.get(&cluster.node("10.0.0.2").instance_id()),
        Some(&vec![3, 4, 5])
    );
    assert_eq!(
        by_instance.get(&cluster.node("10.0.0.3").instance_id()),
        Some(&vec![6, 7, 8])
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_every_item_runs_exactly_once_per_round() {
    let mut cluster = TestCluster::new(3, test_job_config(9)).await;

    let reports = cluster.execute_all().await;
    let mut executed: Vec<u32> = reports.iter().flat_map(|r| r.executed.clone()).collect();
    executed.sort_unstable();
    assert_eq!(executed, (0..9).collect::<Vec<_>>());
    assert!(reports.iter().all(|r| r.failed.is_empty() && !r.failover));

    // Each instance ran exactly what it owns.
    let by_instance = cluster.items_by_instance().await;
    for node in cluster.nodes.values() {
        assert_eq!(
            node.executed_items(),
            by_instance.get(&node.instance_id()).cloned().unwrap_or_default()
        );
    }

    // Running markers are gone once the round completed.
    let admin = cluster.admin();
    for item in 0..9 {
        assert!(!admin.is_job_node_existed(&path::running_node(item)).await.unwrap());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_crashed_instance_triggers_resharding_over_survivors() {
    let mut cluster = TestCluster::new(3, test_job_config(9)).await;
    cluster.reshard().await;

    let crashed = cluster.crash_node("10.0.0.3").expect("node should exist");
    let crashed_id = crashed.instance_id();

    assert_eventually(
        || async { cluster.is_need_sharding().await },
        Duration::from_secs(5),
        "Losing an instance should request resharding",
    )
    .await;
    cluster.reshard().await;

    let by_instance = cluster.items_by_instance().await;
    assert!(!by_instance.contains_key(&crashed_id));
    let mut counts: Vec<usize> = by_instance.values().map(Vec::len).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![4, 5]);
    assert!(cluster.assignment().await.values().all(Option::is_some));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_joining_instance_triggers_resharding() {
    let mut cluster = TestCluster::new(2, test_job_config(4)).await;
    cluster.reshard().await;

    cluster.add_node("10.0.0.3").await;
    assert_eventually(
        || async { cluster.is_need_sharding().await },
        Duration::from_secs(5),
        "A new instance should request resharding",
    )
    .await;
    cluster.reshard().await;

    let new_id = cluster.node("10.0.0.3").instance_id();
    let by_instance = cluster.items_by_instance().await;
    assert_eq!(by_instance.len(), 3);
    assert!(by_instance.contains_key(&new_id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_static_sharding_keeps_first_assignment() {
    let config = test_job_config(6).with_static_sharding(true);
    let mut cluster = TestCluster::new(3, config).await;
    cluster.reshard().await;
    let before = cluster.assignment().await;

    cluster.add_node("10.0.0.4").await;
    let crashed = cluster.crash_node("10.0.0.3").expect("node should exist");
    let crashed_items = cluster.items_by_instance().await.remove(&crashed.instance_id()).unwrap_or_default();
    assert_eq!(crashed_items.len(), 2);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(
        !cluster.is_need_sharding().await,
        "Static assignments are not recomputed on topology changes"
    );
    cluster.reshard().await;
    assert_eq!(cluster.assignment().await, before);

    // Survivors keep to their own items; the crashed one's stay unrun.
    let reports = cluster.execute_all().await;
    for report in &reports {
        for item in &crashed_items {
            assert!(!report.executed.contains(item), "Item {item} belongs to the crashed instance");
        }
    }
    let mut executed: Vec<u32> = reports.iter().flat_map(|r| r.executed.clone()).collect();
    executed.sort_unstable();
    let expected: Vec<u32> = (0..6).filter(|item| !crashed_items.contains(item)).collect();
    assert_eq!(executed, expected);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_items_over_three_instances_one_each() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;
    cluster.reshard().await;

    let by_instance = cluster.items_by_instance().await;
    assert_eq!(by_instance.len(), 3);
    assert!(by_instance.values().all(|items| items.len() == 1));
    assert!(cluster.assignment().await.values().all(Option::is_some));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_items_over_two_survivors_split_two_and_one() {
    let mut cluster = TestCluster::new(3, test_job_config(3)).await;
    cluster.reshard().await;

    let crashed = cluster.crash_node("10.0.0.2").expect("node should exist");
    assert_eventually(
        || async { cluster.is_need_sharding().await },
        Duration::from_secs(5),
        "Losing an instance should request resharding",
    )
    .await;
    cluster.reshard().await;

    let by_instance = cluster.items_by_instance().await;
    assert!(!by_instance.contains_key(&crashed.instance_id()));
    let mut counts: Vec<usize> = by_instance.values().map(Vec::len).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_resharding_keeps_assignment_when_no_instance_is_left() {
    let mut cluster = TestCluster::new(2, test_job_config(2)).await;
    cluster.reshard().await;
    let before = cluster.assignment().await;
    assert!(before.values().all(Option::is_some));

    // The leader waits on an item still running elsewhere.
    let admin = cluster.admin();
    let busy = cluster.node("10.0.0.2").instance_id();
    admin.fill_job_node(&path::running_node(1), &busy).await.unwrap();
    let leader_id = cluster.leader_id().await.expect("a leader should be elected");
    let services = cluster
        .node_by_instance(&leader_id)
        .await
        .expect("leader should be part of the cluster")
        .scheduler
        .services()
        .clone();
    services.sharding.set_resharding_flag().await.unwrap();
    let servers = services.servers.clone();
    let resharding = tokio::spawn(async move { services.sharding.sharding_if_necessary().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!resharding.is_finished(), "Sharding should wait for running items");

    for ip in ["10.0.0.1", "10.0.0.2"] {
        servers.set_status(ip, ServerStatus::Disabled).await.unwrap();
    }
    admin.remove_job_node_if_existed(&path::running_node(1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), resharding)
        .await
        .expect("sharding should finish")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.assignment().await, before);
    assert!(cluster.is_need_sharding().await, "Resharding stays pending");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_total_count_change_requests_resharding() {
    let mut cluster = TestCluster::new(2, test_job_config(4)).await;
    cluster.reshard().await;

    let admin = cluster.admin();
    let config = test_job_config(6).to_json().unwrap();
    admin.fill_job_node(path::CONFIG, &config).await.unwrap();

    assert_eventually(
        || async { cluster.is_need_sharding().await },
        Duration::from_secs(5),
        "A new item count should request resharding",
    )
    .await;
    cluster.reshard().await;

    let assignment = cluster.assignment().await;
    assert_eq!(assignment.len(), 6);
    assert!(assignment.values().all(Option::is_some));
    let node = cluster.node("10.0.0.1");
    assert_eventually(
        || async { node.job_registry.current_sharding_total_count(test_harness::JOB) == 6 },
        Duration::from_secs(5),
        "Every instance should track the new item count",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_update_is_ignored() {
    let mut cluster = TestCluster::new(2, test_job_config(4)).await;
    cluster.reshard().await;
    let before = cluster.assignment().await;

    let admin = cluster.admin();
    let mut zero_items = test_job_config(4);
    zero_items.sharding_total_count = 0;
    let unknown_strategy = test_job_config(4).with_strategy("NO_SUCH_STRATEGY");
    for config in [zero_items, unknown_strategy] {
        admin.fill_job_node(path::CONFIG, &config.to_json().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!cluster.is_need_sharding().await, "Invalid update should not request resharding");
        assert_eq!(cluster.assignment().await, before);
        for node in cluster.nodes.values() {
            assert_eq!(node.job_registry.current_sharding_total_count(test_harness::JOB), 4);
        }

        // Runs keep going on the last valid configuration.
        let reports = cluster.execute_all().await;
        let mut executed: Vec<u32> = reports.iter().flat_map(|r| r.executed.clone()).collect();
        executed.sort_unstable();
        assert_eq!(executed, vec![0, 1, 2, 3]);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_disabled_items_are_skipped() {
    let mut cluster = TestCluster::new(1, test_job_config(3)).await;
    let node = cluster.node("10.0.0.1");
    node.scheduler
        .services()
        .execution
        .set_item_disabled(1, true)
        .await
        .unwrap();

    let report = node.execute_once().await.unwrap();
    let mut executed = report.executed.clone();
    executed.sort_unstable();
    assert_eq!(executed, vec![0, 2]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_disabled_host_gets_no_items() {
    let mut cluster = TestCluster::new(2, test_job_config(4)).await;
    cluster.reshard().await;

    let disabled = cluster.node("10.0.0.2");
    disabled
        .scheduler
        .services()
        .servers
        .set_status("10.0.0.2", elastic_lite::topology::ServerStatus::Disabled)
        .await
        .unwrap();
    assert_eventually(
        || async { cluster.is_need_sharding().await },
        Duration::from_secs(5),
        "Disabling a host should request resharding",
    )
    .await;
    cluster.reshard().await;

    let by_instance = cluster.items_by_instance().await;
    assert_eq!(by_instance.len(), 1);
    assert_eq!(
        by_instance.get(&cluster.node("10.0.0.1").instance_id()),
        Some(&vec![0, 1, 2, 3])
    );
    let report = cluster.node("10.0.0.2").execute_once().await.unwrap();
    assert!(report.executed.is_empty());

    cluster.shutdown().await;
}
