//! Leader election under a healthy and an adversarial virtual network.

use keelson_consensus::{NodeId, RaftRole};
use keelson_harness::{assert_eventually, test_config, KvCommand, SimCluster};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn five_nodes_elect_exactly_one_leader() {
    let mut cluster = SimCluster::new(5, 1);

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert!(leader.is_some(), "no leader elected");

    assert_eventually(
        || async { cluster.count_leaders().await == 1 },
        Duration::from_secs(5),
        "cluster did not settle on a single leader",
    )
    .await;

    // Followers agree on who leads
    let leader = cluster.leader_ids().await[0];
    assert_eventually(
        || async {
            cluster
                .statuses()
                .await
                .values()
                .all(|status| status.leader_id == Some(leader))
        },
        Duration::from_secs(5),
        "followers did not learn the leader",
    )
    .await;

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn at_most_one_leader_per_term() {
    for seed in 0..4 {
        let mut cluster = SimCluster::new(5, seed);

        // Sample roles continuously; a term may never have two leaders
        let mut leaders_by_term: HashMap<u64, NodeId> = HashMap::new();
        for _ in 0..60 {
            for (id, status) in cluster.statuses().await {
                if status.role == RaftRole::Leader {
                    if let Some(previous) = leaders_by_term.insert(status.term.0, id) {
                        assert_eq!(
                            previous, id,
                            "two leaders in term {} (seed {seed})",
                            status.term.0
                        );
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        cluster.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn leader_crash_triggers_reelection() {
    let mut cluster = SimCluster::new(5, 2);

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("initial leader");

    // A few committed writes before the crash
    for i in 0..3 {
        cluster
            .propose_committed(
                KvCommand::put(format!("k{i}"), "before").encode(),
                Duration::from_secs(5),
            )
            .await
            .expect("write before crash");
    }

    cluster.crash(old_leader);

    // A replacement emerges within a few missed heartbeat intervals
    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("no new leader after crash");
    assert_ne!(new_leader, old_leader);

    // And the cluster accepts new writes
    cluster
        .propose_committed(KvCommand::put("after", "crash").encode(), Duration::from_secs(5))
        .await
        .expect("write after crash");

    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn split_votes_eventually_converge() {
    // A nearly-degenerate timeout range makes candidacies collide; the
    // remaining jitter plus per-node RNGs must still break the tie.
    let config = {
        let mut config = test_config();
        config.election_timeout_min = Duration::from_millis(150);
        config.election_timeout_max = Duration::from_millis(155);
        config
    };
    let mut cluster = SimCluster::with_config(3, 7, config);

    let leader = cluster.wait_for_leader(Duration::from_secs(20)).await;
    assert!(leader.is_some(), "split votes never converged");

    cluster.shutdown();
}
