//! Three-node replicated key-value store, in one process.
//!
//! Commands flow through real leader election and log replication over
//! the simulated network.
//!
//! Run with: cargo run --example simple_kv -p keelson-harness

use anyhow::Result;
use keelson_harness::{decode_result, KvCommand, SimCluster};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== keelson replicated KV demo ===\n");

    let mut cluster = SimCluster::new(3, 42);
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("no leader elected");
    println!("leader elected: {leader}\n");

    for (key, value) in [("username", "alice"), ("role", "admin")] {
        let result = cluster
            .propose_committed(KvCommand::put(key, value).encode(), Duration::from_secs(5))
            .await?;
        println!(
            "PUT {key} = {value} (prior: {:?})",
            decode_result(&result).flatten()
        );
    }

    let result = cluster
        .propose_committed(KvCommand::get("username").encode(), Duration::from_secs(5))
        .await?;
    println!("GET username -> {:?}", decode_result(&result).flatten());

    let result = cluster
        .propose_committed(KvCommand::delete("username").encode(), Duration::from_secs(5))
        .await?;
    println!("DELETE username (was: {:?})", decode_result(&result).flatten());

    let result = cluster
        .propose_committed(KvCommand::get("username").encode(), Duration::from_secs(5))
        .await?;
    println!("GET username -> {:?}", decode_result(&result).flatten());

    cluster.shutdown();
    println!("\nall nodes stopped");
    Ok(())
}
