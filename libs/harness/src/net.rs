//! Deterministic simulated network.
//!
//! All inter-node RPCs flow through a [`SimNet`]: a registry of in-process
//! node handles plus controllable fault state. Messages can be dropped,
//! delayed (concurrent deliveries with different delays reorder), or
//! duplicated, and node pairs can be partitioned. Faults are driven by a
//! seeded RNG, and all delays run on tokio's clock, so a paused-clock test
//! with a fixed seed replays identically.

use keelson_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, RaftError, RaftNode, RequestVoteRequest, RequestVoteResponse, Result, Transport,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Message-level fault settings.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability a message is silently dropped.
    pub drop_rate: f64,

    /// Probability a delivered message is delivered twice.
    pub duplicate_rate: f64,

    /// Delivery delay range; variance between concurrent sends is what
    /// produces reordering.
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }
}

impl FaultConfig {
    /// A lossy, reordering, duplicating network.
    pub fn chaotic() -> Self {
        Self {
            drop_rate: 0.1,
            duplicate_rate: 0.1,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(40),
        }
    }
}

struct NetInner {
    nodes: HashMap<NodeId, RaftNode>,
    blocked: HashSet<(NodeId, NodeId)>,
    faults: FaultConfig,
    rng: StdRng,
}

/// The cluster-wide virtual network.
pub struct SimNet {
    inner: Mutex<NetInner>,
}

enum Plan {
    Unreachable,
    Deliver { delay: Duration, duplicate: Option<Duration> },
}

impl SimNet {
    pub fn new(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetInner {
                nodes: HashMap::new(),
                blocked: HashSet::new(),
                faults: FaultConfig::default(),
                rng: StdRng::seed_from_u64(seed),
            }),
        })
    }

    /// Attach a node; a deregistered (crashed) node is unreachable.
    pub fn register(&self, id: NodeId, handle: RaftNode) {
        self.inner.lock().nodes.insert(id, handle);
    }

    pub fn deregister(&self, id: NodeId) {
        self.inner.lock().nodes.remove(&id);
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.inner.lock().faults = faults;
    }

    /// Block all traffic between the two groups, in both directions.
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut inner = self.inner.lock();
        for &a in group_a {
            for &b in group_b {
                inner.blocked.insert(pair(a, b));
            }
        }
    }

    /// Restore traffic between the two groups.
    pub fn heal(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut inner = self.inner.lock();
        for &a in group_a {
            for &b in group_b {
                inner.blocked.remove(&pair(a, b));
            }
        }
    }

    pub fn heal_all(&self) {
        self.inner.lock().blocked.clear();
    }

    pub fn is_blocked(&self, a: NodeId, b: NodeId) -> bool {
        self.inner.lock().blocked.contains(&pair(a, b))
    }

    /// Decide the fate of one message.
    fn plan(&self, from: NodeId, to: NodeId) -> Plan {
        let mut inner = self.inner.lock();
        if inner.blocked.contains(&pair(from, to)) || !inner.nodes.contains_key(&to) {
            return Plan::Unreachable;
        }
        let drop_rate = inner.faults.drop_rate;
        if inner.rng.gen_bool(drop_rate) {
            trace!(from = from.0, to = to.0, "dropping message");
            return Plan::Unreachable;
        }
        let delay = random_delay(&mut inner);
        let duplicate_rate = inner.faults.duplicate_rate;
        let duplicate = if inner.rng.gen_bool(duplicate_rate) {
            Some(random_delay(&mut inner))
        } else {
            None
        };
        Plan::Deliver { delay, duplicate }
    }

    /// Look a handle up at delivery time; the target may have crashed or
    /// been partitioned away while the message was in flight.
    fn handle(&self, from: NodeId, to: NodeId) -> Option<RaftNode> {
        let inner = self.inner.lock();
        if inner.blocked.contains(&pair(from, to)) {
            return None;
        }
        inner.nodes.get(&to).cloned()
    }
}

fn random_delay(inner: &mut NetInner) -> Duration {
    let min = inner.faults.min_delay.as_micros() as u64;
    let max = inner.faults.max_delay.as_micros() as u64;
    Duration::from_micros(inner.rng.gen_range(min..=max))
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// One node's view of the [`SimNet`].
pub struct SimTransport {
    origin: NodeId,
    net: Arc<SimNet>,
}

impl SimTransport {
    pub fn new(origin: NodeId, net: Arc<SimNet>) -> Self {
        Self { origin, net }
    }
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let (delay, duplicate) = match self.net.plan(self.origin, target) {
            Plan::Unreachable => return Err(RaftError::Unreachable(target)),
            Plan::Deliver { delay, duplicate } => (delay, duplicate),
        };
        if let Some(extra) = duplicate {
            let net = Arc::clone(&self.net);
            let origin = self.origin;
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(extra).await;
                if let Some(handle) = net.handle(origin, target) {
                    let _ = handle.request_vote(request).await;
                }
            });
        }
        tokio::time::sleep(delay).await;
        match self.net.handle(self.origin, target) {
            Some(handle) => Ok(handle.request_vote(request).await),
            None => Err(RaftError::Unreachable(target)),
        }
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (delay, duplicate) = match self.net.plan(self.origin, target) {
            Plan::Unreachable => return Err(RaftError::Unreachable(target)),
            Plan::Deliver { delay, duplicate } => (delay, duplicate),
        };
        if let Some(extra) = duplicate {
            let net = Arc::clone(&self.net);
            let origin = self.origin;
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(extra).await;
                if let Some(handle) = net.handle(origin, target) {
                    // The duplicate's response goes nowhere
                    let _ = handle.append_entries(request).await;
                }
            });
        }
        tokio::time::sleep(delay).await;
        match self.net.handle(self.origin, target) {
            Some(handle) => Ok(handle.append_entries(request).await),
            None => Err(RaftError::Unreachable(target)),
        }
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (delay, duplicate) = match self.net.plan(self.origin, target) {
            Plan::Unreachable => return Err(RaftError::Unreachable(target)),
            Plan::Deliver { delay, duplicate } => (delay, duplicate),
        };
        if let Some(extra) = duplicate {
            let net = Arc::clone(&self.net);
            let origin = self.origin;
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(extra).await;
                if let Some(handle) = net.handle(origin, target) {
                    let _ = handle.install_snapshot(request).await;
                }
            });
        }
        tokio::time::sleep(delay).await;
        match self.net.handle(self.origin, target) {
            Some(handle) => Ok(handle.install_snapshot(request).await),
            None => Err(RaftError::Unreachable(target)),
        }
    }
}
