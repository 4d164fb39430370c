//! Fault-injection harness for the keelson consensus engine.
//!
//! Everything needed to torture a Raft cluster deterministically in one
//! process:
//!
//! - [`SimNet`]/[`SimTransport`] — a virtual network that drops, delays
//!   (and thereby reorders), and duplicates messages, and partitions node
//!   groups, all driven by a seeded RNG.
//! - [`SimCluster`] — builds N nodes over the virtual network with
//!   storage that survives crash/restart, and records every node's
//!   applied stream per incarnation.
//! - [`check`] — log-matching, state-machine-safety, and linearizability
//!   checkers over those recordings.
//! - [`KvStore`] — a deterministic key-value state machine whose results
//!   carry the observed prior value, so the checker can replay them.
//!
//! The virtual clock is tokio's paused test clock: run scenario tests
//! under `#[tokio::test(start_paused = true)]` and elections, heartbeats,
//! and simulated delays all execute in virtual time, deterministically
//! for a fixed seed.

pub mod check;
pub mod cluster;
pub mod kv;
pub mod net;

pub use check::{
    assert_linearizable, assert_log_matching, assert_state_machine_safety, check_histories,
    Histories, Violation,
};
pub use cluster::{assert_eventually, test_config, wait_for, SharedStore, SimCluster};
pub use kv::{apply_to_model, decode_result, KvCommand, KvStore};
pub use net::{FaultConfig, SimNet, SimTransport};
