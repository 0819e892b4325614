//! Chaos tests: lossy links, churn and crashes combined.
//!
//! These tests verify that safety holds and progress resumes when messages
//! are dropped or delayed at random and nodes come and go.


use std::time::Duration;
use test_harness::TestCluster;

/// Test 1: Commands still commit over an unreliable network
#[tokio::test]
async fn test_unreliable_agreement() {
    let mut cluster = TestCluster::new(5).await;
    cluster.network.set_unreliable(true);

    for i in 0..20u8 {
        cluster
            .one(&[i], 1, Duration::from_secs(10))
            .await
            .unwrap_or_else(|| panic!("command {} should commit", i));
    }

    cluster.network.set_unreliable(false);
    cluster.one(b"final", 5, Duration::from_secs(10)).await.expect("commit");
    cluster.verify_applied_consistency().await;

    cluster.shutdown().await;
}

/// Test 2: Rapid leader churn never produces two leaders in a term
#[tokio::test]
async fn test_rapid_leader_churn() {
    let mut cluster = TestCluster::new(5).await;
    let all = cluster.active_node_ids();

    for round in 0..5u8 {
        let leader = cluster.check_one_leader(&all, Duration::from_secs(5)).await;
        cluster.isolate_node(leader).await;
        let rest: Vec<u64> = all.iter().copied().filter(|&id| id != leader).collect();
        cluster.check_one_leader(&rest, Duration::from_secs(5)).await;
        cluster
            .one(&[round], 3, Duration::from_secs(10))
            .await
            .expect("commit after churn");
        cluster.heal_node(leader).await;
    }

    cluster.one(b"settled", 5, Duration::from_secs(10)).await.expect("commit");
    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 3: Flapping links with crashes and restarts keep logs consistent
#[tokio::test]
async fn test_network_flapping_with_crashes() {
    let mut cluster = TestCluster::new(5).await;
    let all = cluster.active_node_ids();
    cluster.network.set_unreliable(true);

    let mut committed = 0usize;
    for round in 0..6u64 {
        let victim = round % 5 + 1;
        cluster.crash_node(victim).await;
        if cluster
            .one(format!("r{}", round).as_bytes(), 1, Duration::from_secs(10))
            .await
            .is_some()
        {
            committed += 1;
        }
        cluster.start_node(victim).await;
    }
    assert!(committed > 0, "some commands should commit despite the chaos");

    cluster.network.set_unreliable(false);
    cluster.one(b"end", 5, Duration::from_secs(15)).await.expect("commit");
    assert!(
        cluster
            .wait_for_applied_on_nodes(&all, committed + 1, Duration::from_secs(10))
            .await
    );
    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 4: An idle cluster sends a bounded number of RPCs
#[tokio::test]
async fn test_idle_rpc_budget() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let before = cluster.network.rpc_count();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let sent = cluster.network.rpc_count() - before;

    // Two heartbeats per interval; allow headroom for an occasional election
    assert!(sent < 200, "too many RPCs while idle: {}", sent);
    assert!(sent > 10, "leader should be sending heartbeats, saw {}", sent);

    cluster.shutdown().await;
}
