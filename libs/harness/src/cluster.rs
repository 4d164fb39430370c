//! In-process test cluster.
//!
//! Builds N Raft nodes over the simulated network, with per-node storage
//! that survives crash/restart (the "disk" outlives the node task). Every
//! node's applied stream is recorded per incarnation for the checkers in
//! [`crate::check`].
//!
//! Run cluster tests under `#[tokio::test(start_paused = true)]`: all
//! timers and simulated delays use tokio's clock, so a paused test with a
//! fixed seed is deterministic and runs in virtual time.

use crate::kv::KvStore;
use crate::net::{SimNet, SimTransport};
use keelson_consensus::{
    AppliedEntry, Entry, HardState, LogDump, LogIndex, MemoryStore, NodeId, NodeStatus,
    RaftConfig, RaftConfigBuilder, RaftError, RaftNode, RaftRole, Result, Snapshot, Storage, Term,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Memory-backed storage whose contents outlive a node incarnation.
///
/// Raft's durability contract is modeled exactly: whatever was written
/// before the crash is present on restart, nothing else.
#[derive(Clone, Default)]
pub struct SharedStore(Arc<Mutex<MemoryStore>>);

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for SharedStore {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.0.lock().append(entries)
    }
    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.0.lock().truncate_from(index)
    }
    fn entry(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.0.lock().entry(index)
    }
    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        self.0.lock().entries_from(start, max)
    }
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        self.0.lock().term_at(index)
    }
    fn last_index(&self) -> LogIndex {
        self.0.lock().last_index()
    }
    fn last_term(&self) -> Term {
        self.0.lock().last_term()
    }
    fn compacted_index(&self) -> LogIndex {
        self.0.lock().compacted_index()
    }
    fn compacted_term(&self) -> Term {
        self.0.lock().compacted_term()
    }
    fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.0.lock().compact_through(index, term)
    }
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.0.lock().install_snapshot(snapshot)
    }
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.0.lock().save_hard_state(state)
    }
    fn load_hard_state(&self) -> Result<HardState> {
        self.0.lock().load_hard_state()
    }
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.0.lock().save_snapshot(snapshot)
    }
    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.0.lock().load_snapshot()
    }
}

/// Applied entries per node, one inner vec per incarnation.
pub type NodeHistory = Arc<Mutex<Vec<Vec<AppliedEntry>>>>;

/// A Raft config sized for simulation tests.
pub fn test_config() -> RaftConfig {
    RaftConfigBuilder::new()
        .election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .heartbeat_interval(Duration::from_millis(50))
        .rpc_timeout(Duration::from_millis(50))
        .build()
}

/// A cluster of in-process Raft nodes on a simulated network.
pub struct SimCluster {
    pub net: Arc<SimNet>,
    config: RaftConfig,
    seed: u64,
    ids: Vec<NodeId>,
    nodes: HashMap<NodeId, RaftNode>,
    storages: HashMap<NodeId, SharedStore>,
    histories: HashMap<NodeId, NodeHistory>,
}

impl SimCluster {
    /// Build and start `n` nodes with the default test config.
    pub fn new(n: usize, seed: u64) -> Self {
        Self::with_config(n, seed, test_config())
    }

    pub fn with_config(n: usize, seed: u64, config: RaftConfig) -> Self {
        let ids: Vec<NodeId> = (1..=n as u64).map(NodeId).collect();
        let mut cluster = Self {
            net: SimNet::new(seed),
            config,
            seed,
            ids: ids.clone(),
            nodes: HashMap::new(),
            storages: HashMap::new(),
            histories: HashMap::new(),
        };
        for id in ids {
            cluster.start_node(id);
        }
        cluster
    }

    fn start_node(&mut self, id: NodeId) {
        let storage = self.storages.entry(id).or_default().clone();
        let transport = Arc::new(SimTransport::new(id, Arc::clone(&self.net)));

        let mut config = self.config.clone();
        // Distinct, reproducible election jitter per node and cluster seed
        config.seed = Some(self.seed.wrapping_mul(1_000_003).wrapping_add(id.0));

        let (node, mut applied) = RaftNode::new(
            id,
            self.ids.clone(),
            config,
            Box::new(storage),
            transport,
            KvStore::new(),
        )
        .expect("node starts");

        let history = self.histories.entry(id).or_default().clone();
        let incarnation = {
            let mut history = history.lock();
            history.push(Vec::new());
            history.len() - 1
        };
        tokio::spawn(async move {
            while let Some(entry) = applied.recv().await {
                history.lock()[incarnation].push(entry);
            }
        });

        self.net.register(id, node.clone());
        self.nodes.insert(id, node);
    }

    /// Stop a node, keeping its durable storage. In-flight messages to it
    /// become unreachable.
    pub fn crash(&mut self, id: NodeId) {
        self.net.deregister(id);
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown();
        }
    }

    /// Restart a crashed node from its durable storage.
    pub fn restart(&mut self, id: NodeId) {
        assert!(
            !self.nodes.contains_key(&id),
            "restarting a node that is still running"
        );
        self.start_node(id);
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn all_ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn node(&self, id: NodeId) -> Option<&RaftNode> {
        self.nodes.get(&id)
    }

    pub async fn statuses(&self) -> HashMap<NodeId, NodeStatus> {
        let mut out = HashMap::new();
        for (&id, node) in &self.nodes {
            if let Ok(status) = node.status().await {
                out.insert(id, status);
            }
        }
        out
    }

    pub async fn leader_ids(&self) -> Vec<NodeId> {
        let mut leaders: Vec<NodeId> = self
            .statuses()
            .await
            .into_iter()
            .filter(|(_, status)| status.role == RaftRole::Leader)
            .map(|(id, _)| id)
            .collect();
        leaders.sort();
        leaders
    }

    pub async fn count_leaders(&self) -> usize {
        self.leader_ids().await.len()
    }

    /// Wait until some live node considers itself leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        self.wait_for_leader_in(&self.live_ids(), timeout).await
    }

    /// Wait until some node in `group` considers itself leader.
    pub async fn wait_for_leader_in(
        &self,
        group: &[NodeId],
        timeout: Duration,
    ) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            for (&id, status) in &self.statuses().await {
                if group.contains(&id) && status.role == RaftRole::Leader {
                    return Some(id);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit a command wherever the cluster will take it; acked once the
    /// leader has it durably in its log.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            for id in self.live_ids() {
                let Some(node) = self.nodes.get(&id) else {
                    continue;
                };
                match node.submit(command.clone()).await {
                    Ok(ack) => return Ok(ack),
                    Err(RaftError::NotLeader(_))
                    | Err(RaftError::ShuttingDown)
                    | Err(RaftError::Faulted) => continue,
                    Err(other) => return Err(other),
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Submit and wait until the command commits and applies; retries
    /// through leader changes. At-least-once: a retry after an ambiguous
    /// timeout may commit the command twice, which the checkers treat as
    /// two distinct operations.
    pub async fn propose_committed(&self, command: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            for id in self.live_ids() {
                let Some(node) = self.nodes.get(&id) else {
                    continue;
                };
                let attempt = tokio::time::timeout(
                    Duration::from_millis(500),
                    node.propose(command.clone()),
                )
                .await;
                match attempt {
                    Ok(Ok(result)) => return Ok(result),
                    // Not the leader, or a stale leader that cannot commit
                    Ok(Err(_)) | Err(_) => continue,
                }
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until every node in `group` has applied through `index`.
    pub async fn wait_for_applied_on(
        &self,
        group: &[NodeId],
        index: LogIndex,
        timeout: Duration,
    ) -> bool {
        wait_for(
            || async {
                let statuses = self.statuses().await;
                group.iter().all(|id| {
                    statuses
                        .get(id)
                        .map(|status| status.last_applied >= index)
                        .unwrap_or(false)
                })
            },
            timeout,
            Duration::from_millis(20),
        )
        .await
    }

    /// Wait until every live node has applied through `index`.
    pub async fn wait_for_applied(&self, index: LogIndex, timeout: Duration) -> bool {
        self.wait_for_applied_on(&self.live_ids(), index, timeout)
            .await
    }

    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.net.partition(group_a, group_b);
    }

    /// Cut one node off from everyone else.
    pub fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = self.ids.iter().copied().filter(|&n| n != id).collect();
        self.net.partition(&[id], &others);
    }

    pub fn heal_all(&self) {
        self.net.heal_all();
    }

    pub async fn dump_logs(&self) -> HashMap<NodeId, LogDump> {
        let mut out = HashMap::new();
        for (&id, node) in &self.nodes {
            if let Ok(dump) = node.dump_log().await {
                out.insert(id, dump);
            }
        }
        out
    }

    /// Deep copy of every node's applied history, per incarnation.
    pub fn histories(&self) -> HashMap<NodeId, Vec<Vec<AppliedEntry>>> {
        self.histories
            .iter()
            .map(|(&id, history)| (id, history.lock().clone()))
            .collect()
    }

    pub fn shutdown(&mut self) {
        for id in self.live_ids() {
            self.crash(id);
        }
    }
}

/// Wait for a condition to become true, polling on the virtual clock.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let ok = wait_for(condition, timeout, Duration::from_millis(20)).await;
    assert!(ok, "{}", message);
}
