//! Log replication tests.
//!
//! These tests verify that submitted commands are committed and applied on
//! every node in the same order, that followers catch up after falling behind,
//! and that uncommitted entries from a deposed leader are overwritten.


use std::time::Duration;
use raft_lite::error::RaftError;
use test_harness::TestCluster;

/// Test 1: Commands commit in order with consecutive indices
#[tokio::test]
async fn test_basic_agreement() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    for i in 1..=3u64 {
        let (count, _) = cluster.n_committed(i).await;
        assert_eq!(count, 0, "nothing should be committed before submit");

        let command = format!("cmd-{}", i);
        let index = cluster
            .one(command.as_bytes(), 3, Duration::from_secs(5))
            .await
            .expect("command should commit on all nodes");
        assert_eq!(index, i, "got index {} but expected {}", index, i);
    }

    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 2: Submit returns the index and term the entry will occupy
#[tokio::test]
async fn test_submit_returns_index_and_term() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let term = cluster.get_node(leader).unwrap().current_term().await;

    let (index, submitted_term) = cluster
        .submit_to_node(leader, b"x")
        .await
        .expect("leader accepts commands");
    assert_eq!(index, 1);
    assert_eq!(submitted_term, term);

    assert!(
        cluster
            .wait_for_applied_on_nodes(&cluster.active_node_ids(), 1, Duration::from_secs(3))
            .await,
        "entry should be applied everywhere"
    );
    for id in cluster.active_node_ids() {
        let applied = cluster.get_node(id).unwrap().applied().await;
        assert_eq!(applied[0].index, 1);
        assert_eq!(applied[0].term, term);
        assert_eq!(applied[0].command, b"x".to_vec());
    }

    cluster.shutdown().await;
}

/// Test 3: Followers reject commands and point at the leader
#[tokio::test]
async fn test_submit_to_follower_is_rejected() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    // Give followers a heartbeat to learn the leader
    tokio::time::sleep(Duration::from_millis(100)).await;

    let follower = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    let err = cluster
        .get_node(follower)
        .unwrap()
        .raft_node
        .submit(b"nope".to_vec())
        .await
        .unwrap_err();
    match err {
        RaftError::NotLeader(hint) => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    cluster.shutdown().await;
}

/// Test 4: A majority keeps committing while one follower is away, and the
/// follower catches up when it returns
#[tokio::test]
async fn test_follower_failure_and_catch_up() {
    let mut cluster = TestCluster::new(3).await;
    let all = cluster.active_node_ids();

    cluster.one(b"101", 3, Duration::from_secs(5)).await.expect("commit");

    let leader = cluster.check_one_leader(&all, Duration::from_secs(5)).await;
    let follower = all.iter().copied().find(|&id| id != leader).unwrap();
    cluster.isolate_node(follower).await;

    // The leader and remaining follower should be able to agree
    cluster.one(b"102", 2, Duration::from_secs(5)).await.expect("commit");
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster.one(b"103", 2, Duration::from_secs(10)).await.expect("commit");

    cluster.heal_node(follower).await;
    cluster.one(b"104", 3, Duration::from_secs(10)).await.expect("commit");
    assert!(
        cluster
            .wait_for_applied_on_nodes(&all, 4, Duration::from_secs(3))
            .await,
        "rejoined follower should apply everything"
    );

    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 5: Without a majority nothing commits; once the majority returns it does
#[tokio::test]
async fn test_no_commit_without_majority() {
    let mut cluster = TestCluster::new(5).await;
    let all = cluster.active_node_ids();

    cluster.one(b"10", 5, Duration::from_secs(5)).await.expect("commit");
    let leader = cluster.check_one_leader(&all, Duration::from_secs(5)).await;

    // Cut three followers off
    let cut: Vec<u64> = all.iter().copied().filter(|&id| id != leader).take(3).collect();
    for &id in &cut {
        cluster.isolate_node(id).await;
    }

    let (index, _) = cluster
        .submit_to_node(leader, b"20")
        .await
        .expect("leader still accepts commands");
    assert_eq!(index, 2, "expected index 2");

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let (count, _) = cluster.n_committed(index).await;
    assert_eq!(count, 0, "{} committed but no majority", count);

    for &id in &cut {
        cluster.heal_node(id).await;
    }

    // Index 2 may or may not survive the election that follows; either way
    // new commands commit
    cluster.one(b"30", 5, Duration::from_secs(10)).await.expect("commit");
    cluster.one(b"1000", 5, Duration::from_secs(10)).await.expect("commit");

    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 6: A partitioned leader's uncommitted entries are replaced after it rejoins
#[tokio::test]
async fn test_rejoin_overwrites_uncommitted_entries() {
    let mut cluster = TestCluster::new(3).await;
    let all = cluster.active_node_ids();

    cluster.one(b"101", 3, Duration::from_secs(5)).await.expect("commit");

    // Leader network failure
    let leader1 = cluster.check_one_leader(&all, Duration::from_secs(5)).await;
    cluster.isolate_node(leader1).await;

    // Make the old leader try to agree on some entries
    for cmd in [&b"102"[..], b"103", b"104"] {
        cluster
            .submit_to_node(leader1, cmd)
            .await
            .expect("isolated leader still believes it leads");
    }

    // New leader commits, also for index 2
    cluster.one(b"103", 2, Duration::from_secs(10)).await.expect("commit");

    // New leader network failure
    let rest: Vec<u64> = all.iter().copied().filter(|&id| id != leader1).collect();
    let leader2 = cluster.check_one_leader(&rest, Duration::from_secs(5)).await;
    cluster.isolate_node(leader2).await;

    // Old leader connected again
    cluster.heal_node(leader1).await;
    cluster.one(b"104", 2, Duration::from_secs(10)).await.expect("commit");

    // All together now
    cluster.heal_node(leader2).await;
    cluster.one(b"105", 3, Duration::from_secs(10)).await.expect("commit");

    let (_, at_two) = cluster.n_committed(2).await;
    assert_eq!(at_two.as_deref(), Some(&b"103"[..]), "index 2 must hold the committed value");

    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 7: Leader backs up quickly over long runs of conflicting entries
#[tokio::test]
async fn test_leader_backs_up_over_divergent_logs() {
    let mut cluster = TestCluster::new(5).await;
    let all = cluster.active_node_ids();

    cluster.one(b"start", 5, Duration::from_secs(5)).await.expect("commit");

    // Put leader and one follower in a partition
    let leader1 = cluster.check_one_leader(&all, Duration::from_secs(5)).await;
    let mut others: Vec<u64> = all.iter().copied().filter(|&id| id != leader1).collect();
    let partner = others.remove(0);
    cluster.create_partition(&[leader1, partner], &others).await;

    // Submit lots of commands that won't commit
    for i in 0..50 {
        let _ = cluster
            .submit_to_node(leader1, format!("lost-{}", i).as_bytes())
            .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The other three elect a leader and commit lots of commands
    cluster.check_one_leader(&others, Duration::from_secs(5)).await;
    for i in 0..50 {
        cluster
            .one(format!("kept-{}", i).as_bytes(), 3, Duration::from_secs(5))
            .await
            .expect("majority side commits");
    }

    // Bring the original pair back and let everyone converge
    cluster.heal().await;
    cluster.one(b"final", 5, Duration::from_secs(10)).await.expect("commit");

    for id in cluster.active_node_ids() {
        for msg in cluster.get_node(id).unwrap().applied().await {
            assert!(
                !msg.command.starts_with(b"lost-"),
                "node {} applied an entry that never committed",
                id
            );
        }
    }
    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}

/// Test 8: Concurrent submits all land at distinct indices and commit
#[tokio::test]
async fn test_concurrent_submits() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let node = cluster.get_node(leader).unwrap().raft_node.clone();

    let mut handles = Vec::new();
    for i in 0..5u8 {
        let node = node.clone();
        handles.push(tokio::spawn(async move { node.submit(vec![i]).await }));
    }
    let mut indices = Vec::new();
    for handle in handles {
        let (index, _) = handle.await.unwrap().expect("leader accepts");
        indices.push(index);
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);

    assert!(
        cluster
            .wait_for_applied_on_nodes(&cluster.active_node_ids(), 5, Duration::from_secs(3))
            .await
    );
    cluster.verify_applied_consistency().await;
    cluster.shutdown().await;
}
