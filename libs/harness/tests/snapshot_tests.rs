//! Compaction and snapshot installation on lagging or restarted nodes.

use keelson_consensus::LogIndex;
use keelson_harness::{
    assert_linearizable, assert_log_matching, assert_state_machine_safety, test_config, KvCommand,
    SimCluster,
};
use std::time::Duration;

fn snapshotting_config(threshold: u64, trailing: u64) -> keelson_consensus::RaftConfig {
    let mut config = test_config();
    config.snapshot_threshold = threshold;
    config.snapshot_trailing = trailing;
    config
}

#[tokio::test(start_paused = true)]
async fn lagging_follower_catches_up_via_snapshot() {
    let mut cluster = SimCluster::with_config(3, 30, snapshotting_config(20, 5));
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    // Cut one follower off and write far past the snapshot threshold
    let lagging = cluster
        .live_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    cluster.isolate(lagging);

    for i in 0..60 {
        cluster
            .propose_committed(
                KvCommand::put(format!("k{}", i % 10), format!("v{i}")).encode(),
                Duration::from_secs(10),
            )
            .await
            .expect("write while follower lags");
    }

    // The majority has compacted the prefix the laggard would need
    let majority: Vec<_> = cluster
        .live_ids()
        .into_iter()
        .filter(|&id| id != lagging)
        .collect();
    assert!(
        cluster
            .wait_for_applied_on(&majority, LogIndex(60), Duration::from_secs(10))
            .await
    );
    let statuses = cluster.statuses().await;
    assert!(
        statuses[&leader].first_index > LogIndex(1),
        "leader never compacted"
    );

    // Heal: the laggard must be brought up by InstallSnapshot, not entries
    cluster.heal_all();
    assert!(
        cluster
            .wait_for_applied(LogIndex(60), Duration::from_secs(15))
            .await,
        "lagging follower never caught up"
    );
    let status = cluster.statuses().await[&lagging].clone();
    assert!(
        status.first_index > LogIndex(1),
        "laggard still holds the full log; snapshot was not installed"
    );

    // Committed reads agree on every node, so the snapshot-installed
    // state equals the caught-up-via-log state
    for key in 0..10 {
        cluster
            .propose_committed(KvCommand::get(format!("k{key}")).encode(), Duration::from_secs(10))
            .await
            .expect("read after heal");
    }
    assert!(
        cluster
            .wait_for_applied(LogIndex(70), Duration::from_secs(10))
            .await
    );

    assert_state_machine_safety(&cluster.histories());
    assert_log_matching(&cluster.dump_logs().await);

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn restart_recovers_from_own_snapshot() {
    let mut cluster = SimCluster::with_config(3, 31, snapshotting_config(10, 0));
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    for i in 0..15 {
        cluster
            .propose_committed(
                KvCommand::put(format!("k{i}"), format!("v{i}")).encode(),
                Duration::from_secs(10),
            )
            .await
            .expect("write");
    }
    assert!(
        cluster
            .wait_for_applied(LogIndex(15), Duration::from_secs(5))
            .await
    );

    // Crash a follower that has already snapshotted, then bring it back
    let follower = cluster
        .live_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    cluster.crash(follower);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.restart(follower);

    // It restores from its snapshot and rejoins at the tail of the log
    let status = cluster.statuses().await[&follower].clone();
    assert!(
        status.last_applied >= LogIndex(10),
        "restart did not restore from the snapshot"
    );

    cluster
        .propose_committed(KvCommand::put("post", "restart").encode(), Duration::from_secs(10))
        .await
        .expect("write after restart");
    assert!(
        cluster
            .wait_for_applied(LogIndex(16), Duration::from_secs(10))
            .await
    );

    assert_state_machine_safety(&cluster.histories());
    assert_linearizable(&cluster.histories());

    cluster.shutdown();
}
