//! Log replication, client semantics, and delivery-fault tolerance.

use keelson_consensus::{LogIndex, RaftError};
use keelson_harness::{
    assert_linearizable, assert_log_matching, decode_result, FaultConfig, KvCommand, SimCluster,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn commands_replicate_to_every_node() {
    let mut cluster = SimCluster::new(3, 10);
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    for i in 0..5 {
        cluster
            .propose_committed(
                KvCommand::put(format!("k{i}"), format!("v{i}")).encode(),
                Duration::from_secs(5),
            )
            .await
            .expect("propose");
    }

    assert!(
        cluster
            .wait_for_applied(LogIndex(5), Duration::from_secs(5))
            .await,
        "not all nodes applied the log"
    );

    let dumps = cluster.dump_logs().await;
    assert_log_matching(&dumps);
    for dump in dumps.values() {
        assert_eq!(dump.entries.len(), 5);
    }
    assert_linearizable(&cluster.histories());

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn results_observe_prior_writes() {
    let mut cluster = SimCluster::new(3, 11);
    cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let first = cluster
        .propose_committed(KvCommand::put("k", "v1").encode(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(decode_result(&first), Some(None));

    let second = cluster
        .propose_committed(KvCommand::put("k", "v2").encode(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(decode_result(&second), Some(Some("v1".to_string())));

    let read = cluster
        .propose_committed(KvCommand::get("k").encode(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(decode_result(&read), Some(Some("v2".to_string())));

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn followers_redirect_submissions() {
    let mut cluster = SimCluster::new(3, 12);
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    // Give followers a heartbeat to learn the leader
    tokio::time::sleep(Duration::from_millis(200)).await;

    let follower = cluster
        .live_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    let err = cluster
        .node(follower)
        .unwrap()
        .submit(KvCommand::put("k", "v").encode())
        .await
        .unwrap_err();
    match err {
        RaftError::NotLeader(hint) => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {other}"),
    }

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn survives_duplication_and_reordering() {
    let mut cluster = SimCluster::new(3, 13);
    // Heavy duplication and a wide delay spread so AppendEntries overtake
    // each other on the wire
    cluster.net.set_faults(FaultConfig {
        drop_rate: 0.05,
        duplicate_rate: 0.25,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(40),
    });
    cluster.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    for i in 0..30 {
        cluster
            .propose_committed(
                KvCommand::put(format!("k{}", i % 5), format!("v{i}")).encode(),
                Duration::from_secs(20),
            )
            .await
            .expect("propose under faults");
    }

    // Let replication quiesce, then check every safety property: no entry
    // applied twice, identical logs, results of one sequential order
    cluster.net.set_faults(FaultConfig::default());
    assert!(
        cluster
            .wait_for_applied(LogIndex(30), Duration::from_secs(10))
            .await
    );

    assert_log_matching(&cluster.dump_logs().await);
    assert_linearizable(&cluster.histories());

    cluster.shutdown();
}
