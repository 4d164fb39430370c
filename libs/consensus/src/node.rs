//! Core Raft node implementation
//!
//! A node is a single-owner event loop: a spawned worker task owns the
//! role state, the log, and the state machine. RPC arrivals, RPC replies,
//! timer firings, and client submissions all arrive as commands on one
//! channel, so every transition runs strictly sequentially. Outbound RPCs
//! run in spawned tasks that enqueue term-tagged replies back onto the
//! same channel; replies whose term has gone stale are discarded.

use crate::config::RaftConfig;
use crate::log::{RaftLog, Storage};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::snapshot::SnapshotManager;
use crate::state::{NodeState, RaftRole};
use crate::transport::Transport;
use crate::types::{Entry, LogIndex, NodeId, Snapshot, SnapshotMeta, Term};
use crate::{RaftError, Result};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Trait for state machines replicated via Raft
///
/// `apply` must be deterministic: every replica applies the same committed
/// commands in the same order and must reach the same state and results.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command; called exactly once per index, in order
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Serialize the current state for a snapshot
    fn snapshot(&self) -> Vec<u8>;

    /// Reset state from a snapshot blob
    fn restore(&mut self, snapshot: &[u8]);
}

/// One committed command, as observed by this node's apply loop
#[derive(Debug, Clone)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Vec<u8>,
    pub result: Vec<u8>,
}

/// Stream of entries this node applies, in index order
pub type ApplyStream = mpsc::UnboundedReceiver<AppliedEntry>;

/// Point-in-time view of a node, for tests and operators
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub faulted: bool,
}

/// Retained log contents plus the compaction boundary
#[derive(Debug, Clone)]
pub struct LogDump {
    pub compacted_index: LogIndex,
    pub compacted_term: Term,
    pub entries: Vec<Entry>,
}

/// Commands processed by the node's event loop
enum RaftCommand {
    /// Append a command; ack (index, term) once durably in the local log
    Submit {
        command: Vec<u8>,
        response: oneshot::Sender<Result<(LogIndex, Term)>>,
    },

    /// Append a command and wait until it is applied
    Propose {
        command: Vec<u8>,
        response: oneshot::Sender<Result<Vec<u8>>>,
    },

    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },

    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },

    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },

    /// Reply to a RequestVote we sent; `request_term` is the term the
    /// request was issued in
    VoteReply {
        peer: NodeId,
        request_term: Term,
        response: RequestVoteResponse,
    },

    /// Reply to an AppendEntries we sent
    AppendReply {
        peer: NodeId,
        request_term: Term,
        prev_log_index: LogIndex,
        sent: usize,
        response: AppendEntriesResponse,
    },

    /// Outcome of an InstallSnapshot we sent; `None` means it timed out
    SnapshotReply {
        peer: NodeId,
        request_term: Term,
        last_included: LogIndex,
        response: Option<InstallSnapshotResponse>,
    },

    Status {
        response: oneshot::Sender<NodeStatus>,
    },

    DumpLog {
        response: oneshot::Sender<LogDump>,
    },

    Shutdown,
}

/// Handle to a running Raft node
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
}

impl RaftNode {
    /// Create a Raft node and spawn its event loop.
    ///
    /// Loads `HardState`, log, and snapshot from `storage`; if a snapshot
    /// exists the state machine is restored from it before the loop
    /// starts. Must be called within a Tokio runtime.
    pub fn new<SM: StateMachine, T: Transport>(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<T>,
        mut state_machine: SM,
    ) -> Result<(Self, ApplyStream)> {
        let hard = storage.load_hard_state()?;
        let log = RaftLog::new(storage);

        let mut state = NodeState::new(id, peers, hard);
        let mut snapshot_index = LogIndex::ZERO;
        if let Some(snapshot) = log.load_snapshot()? {
            state_machine.restore(&snapshot.data);
            snapshot_index = snapshot.meta.last_included_index;
            state.commit_index = snapshot_index;
            state.last_applied = snapshot_index;
        }
        let snapshots = SnapshotManager::new(
            config.snapshot_threshold,
            config.snapshot_trailing,
            snapshot_index,
        );

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        let mut worker = RaftWorker {
            state,
            log,
            config,
            state_machine,
            transport,
            snapshots,
            command_tx: command_tx.clone(),
            apply_tx,
            waiters: HashMap::new(),
            rng,
            election_deadline: Instant::now(),
            faulted: false,
        };
        worker.reset_election_deadline();

        info!(node_id = id.0, term = worker.state.hard.current_term.0, "node starting");
        tokio::spawn(worker.run(command_rx));

        Ok((RaftNode { id, command_tx }, apply_rx))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a command to the cluster.
    ///
    /// On the leader, returns the (index, term) the command was appended
    /// at, once the append is durable and replication has been kicked
    /// off. On any other node fails fast with `NotLeader` carrying the
    /// best-known leader.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Submit {
                command,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Submit a command and wait for it to commit and apply; returns the
    /// state machine's result for the command.
    pub async fn propose(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose {
                command,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Handle RequestVote RPC
    pub async fn request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::RequestVote {
                request,
                response: tx,
            })
            .is_err()
        {
            // Node is gone; reject
            return RequestVoteResponse {
                term: Term(0),
                vote_granted: false,
            };
        }

        rx.await.unwrap_or(RequestVoteResponse {
            term: Term(0),
            vote_granted: false,
        })
    }

    /// Handle AppendEntries RPC
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::AppendEntries {
                request,
                response: tx,
            })
            .is_err()
        {
            return AppendEntriesResponse {
                term: Term(0),
                success: false,
                match_index: None,
            };
        }

        rx.await.unwrap_or(AppendEntriesResponse {
            term: Term(0),
            success: false,
            match_index: None,
        })
    }

    /// Handle InstallSnapshot RPC
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::InstallSnapshot {
                request,
                response: tx,
            })
            .is_err()
        {
            return InstallSnapshotResponse { term: Term(0) };
        }

        rx.await.unwrap_or(InstallSnapshotResponse { term: Term(0) })
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Status { response: tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Retained log plus compaction boundary; test/debug aid.
    pub async fn dump_log(&self) -> Result<LogDump> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::DumpLog { response: tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Stop the node's event loop. Pending proposals observe
    /// `ShuttingDown`.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(RaftCommand::Shutdown);
    }
}

/// A client waiting for its proposal to apply
struct Waiter {
    term: Term,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

/// The worker task that owns all node state
struct RaftWorker<SM, T: Transport> {
    state: NodeState,
    log: RaftLog,
    config: RaftConfig,
    state_machine: SM,
    transport: Arc<T>,
    snapshots: SnapshotManager,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
    apply_tx: mpsc::UnboundedSender<AppliedEntry>,
    waiters: HashMap<u64, Waiter>,
    rng: StdRng,
    election_deadline: Instant,
    faulted: bool,
}

impl<SM: StateMachine, T: Transport> RaftWorker<SM, T> {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<RaftCommand>) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let election_deadline = self.election_deadline;
            tokio::select! {
                maybe_cmd = command_rx.recv() => {
                    match maybe_cmd {
                        Some(RaftCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                _ = time::sleep_until(election_deadline),
                    if self.state.role != RaftRole::Leader =>
                {
                    self.on_election_timeout();
                }

                _ = heartbeat.tick(), if self.state.role == RaftRole::Leader => {
                    self.broadcast_append();
                }
            }
        }

        info!(node_id = self.state.id.0, "node shut down");
    }

    fn handle_command(&mut self, cmd: RaftCommand) {
        match cmd {
            RaftCommand::Submit { command, response } => {
                let result = self.append_local(command);
                let ok = result.is_ok();
                let _ = response.send(result);
                if ok {
                    self.advance_commit();
                    self.broadcast_append();
                }
            }

            RaftCommand::Propose { command, response } => match self.append_local(command) {
                Ok((index, term)) => {
                    self.waiters.insert(index.0, Waiter { term, tx: response });
                    self.advance_commit();
                    self.broadcast_append();
                }
                Err(err) => {
                    let _ = response.send(Err(err));
                }
            },

            RaftCommand::RequestVote { request, response } => {
                let reply = self.handle_request_vote(request);
                let _ = response.send(reply);
            }

            RaftCommand::AppendEntries { request, response } => {
                let reply = self.handle_append_entries(request);
                let success = reply.success;
                let _ = response.send(reply);
                if success {
                    self.apply_committed();
                }
            }

            RaftCommand::InstallSnapshot { request, response } => {
                let reply = self.handle_install_snapshot(request);
                let _ = response.send(reply);
            }

            RaftCommand::VoteReply {
                peer,
                request_term,
                response,
            } => self.handle_vote_reply(peer, request_term, response),

            RaftCommand::AppendReply {
                peer,
                request_term,
                prev_log_index,
                sent,
                response,
            } => self.handle_append_reply(peer, request_term, prev_log_index, sent, response),

            RaftCommand::SnapshotReply {
                peer,
                request_term,
                last_included,
                response,
            } => self.handle_snapshot_reply(peer, request_term, last_included, response),

            RaftCommand::Status { response } => {
                let _ = response.send(NodeStatus {
                    id: self.state.id,
                    role: self.state.role,
                    term: self.state.hard.current_term,
                    leader_id: self.state.leader_id,
                    commit_index: self.state.commit_index,
                    last_applied: self.state.last_applied,
                    first_index: self.log.first_index(),
                    last_index: self.log.last_index(),
                    faulted: self.faulted,
                });
            }

            RaftCommand::DumpLog { response } => {
                let entries = self
                    .log
                    .entries_from(self.log.first_index(), usize::MAX)
                    .unwrap_or_default();
                let _ = response.send(LogDump {
                    compacted_index: self.log.compacted_index(),
                    compacted_term: self.log.compacted_term(),
                    entries,
                });
            }

            RaftCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    // ---- durability helpers -------------------------------------------

    /// Latch into the faulted state: a node that cannot persist must stop
    /// acknowledging entries and votes rather than lie about durability.
    fn fault(&mut self, context: &str, err: RaftError) {
        error!(
            node_id = self.state.id.0,
            error = %err,
            context,
            "durable storage failed; node stops participating"
        );
        self.faulted = true;
    }

    /// Flush term/vote; false (and faulted) if the write failed.
    fn persist_hard_state(&mut self) -> bool {
        match self.log.save_hard_state(&self.state.hard) {
            Ok(()) => true,
            Err(err) => {
                self.fault("persisting hard state", err);
                false
            }
        }
    }

    fn reset_election_deadline(&mut self) {
        let timeout = self.config.random_election_timeout(&mut self.rng);
        self.election_deadline = Instant::now() + timeout;
    }

    // ---- elections ----------------------------------------------------

    fn on_election_timeout(&mut self) {
        if self.faulted {
            self.reset_election_deadline();
            return;
        }
        self.start_election();
    }

    fn start_election(&mut self) {
        self.state.become_candidate();
        self.reset_election_deadline();
        if !self.persist_hard_state() {
            return;
        }

        let term = self.state.hard.current_term;
        info!(node_id = self.state.id.0, term = term.0, "starting election");

        // A single-node cluster is its own majority
        if self.state.majority() == 1 {
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.state.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        for peer in self.state.other_peers() {
            let transport = Arc::clone(&self.transport);
            let command_tx = self.command_tx.clone();
            let request = request.clone();
            let rpc_timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                match time::timeout(rpc_timeout, transport.request_vote(peer, request)).await {
                    Ok(Ok(response)) => {
                        let _ = command_tx.send(RaftCommand::VoteReply {
                            peer,
                            request_term: term,
                            response,
                        });
                    }
                    Ok(Err(err)) => trace!(peer = peer.0, error = %err, "vote request failed"),
                    Err(_) => trace!(peer = peer.0, "vote request timed out"),
                }
            });
        }
    }

    fn handle_vote_reply(&mut self, peer: NodeId, request_term: Term, response: RequestVoteResponse) {
        if response.term > self.state.hard.current_term {
            self.step_down(response.term, None);
            return;
        }
        if self.state.role != RaftRole::Candidate || request_term != self.state.hard.current_term {
            return;
        }
        if response.vote_granted {
            debug!(
                node_id = self.state.id.0,
                peer = peer.0,
                term = request_term.0,
                "vote granted"
            );
            if self.state.record_vote(peer) {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        self.state.become_leader(self.log.last_index());
        info!(
            node_id = self.state.id.0,
            term = self.state.hard.current_term.0,
            "became leader"
        );
        self.broadcast_append();
    }

    /// Become follower; a deposed leader fails its pending proposals.
    fn follow(&mut self, term: Term, leader: Option<NodeId>) {
        let was_leader = self.state.role == RaftRole::Leader;
        self.state.become_follower(term, leader);
        if was_leader {
            self.fail_waiters();
        }
    }

    /// Revert to follower on observing a higher term in a reply.
    fn step_down(&mut self, term: Term, leader: Option<NodeId>) {
        let term_advanced = term > self.state.hard.current_term;
        self.follow(term, leader);
        if term_advanced {
            self.persist_hard_state();
        }
        self.reset_election_deadline();
    }

    fn fail_waiters(&mut self) {
        let leader_hint = self.state.leader_id;
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.tx.send(Err(RaftError::NotLeader(leader_hint)));
        }
    }

    // ---- client commands ----------------------------------------------

    fn append_local(&mut self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        if self.faulted {
            return Err(RaftError::Faulted);
        }
        if self.state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(self.state.leader_id));
        }

        let term = self.state.hard.current_term;
        let index = self.log.last_index() + 1;
        let entry = Entry::new(term, index, command);
        match self.log.append(vec![entry]) {
            Ok(()) => {
                debug!(
                    node_id = self.state.id.0,
                    index = index.0,
                    term = term.0,
                    "appended command"
                );
                Ok((index, term))
            }
            Err(err) => {
                self.fault("appending client command", err);
                Err(RaftError::Faulted)
            }
        }
    }

    // ---- replication (leader side) ------------------------------------

    fn broadcast_append(&mut self) {
        for peer in self.state.other_peers() {
            self.replicate_to(peer);
        }
    }

    /// Send the next batch (or a snapshot) to one follower.
    fn replicate_to(&mut self, peer: NodeId) {
        if self.state.role != RaftRole::Leader || self.faulted {
            return;
        }
        let (next_index, snapshot_inflight) = {
            let Some(leader) = self.state.leader.as_ref() else {
                return;
            };
            let Some(progress) = leader.progress.get(&peer) else {
                return;
            };
            (progress.next_index, progress.snapshot_inflight)
        };

        if next_index <= self.log.compacted_index() {
            self.send_snapshot_to(peer, snapshot_inflight);
        } else {
            self.send_entries_to(peer, next_index);
        }
    }

    fn send_entries_to(&mut self, peer: NodeId, next_index: LogIndex) {
        let term = self.state.hard.current_term;
        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index == LogIndex::ZERO {
            Term(0)
        } else {
            match self.log.term_at(prev_log_index) {
                Ok(Some(prev_term)) => prev_term,
                Ok(None) => {
                    warn!(
                        node_id = self.state.id.0,
                        peer = peer.0,
                        prev_log_index = prev_log_index.0,
                        "no term for prev index; skipping send"
                    );
                    return;
                }
                Err(err) => {
                    self.fault("reading prev term for replication", err);
                    return;
                }
            }
        };
        let entries = match self
            .log
            .entries_from(next_index, self.config.max_append_entries)
        {
            Ok(entries) => entries,
            Err(err) => {
                self.fault("reading entries for replication", err);
                return;
            }
        };
        let sent = entries.len();

        let request = AppendEntriesRequest {
            term,
            leader_id: self.state.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index,
        };

        let transport = Arc::clone(&self.transport);
        let command_tx = self.command_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            match time::timeout(rpc_timeout, transport.append_entries(peer, request)).await {
                Ok(Ok(response)) => {
                    let _ = command_tx.send(RaftCommand::AppendReply {
                        peer,
                        request_term: term,
                        prev_log_index,
                        sent,
                        response,
                    });
                }
                Ok(Err(err)) => trace!(peer = peer.0, error = %err, "append entries failed"),
                Err(_) => trace!(peer = peer.0, "append entries timed out"),
            }
        });
    }

    /// The follower is behind our compacted prefix; ship the snapshot.
    fn send_snapshot_to(&mut self, peer: NodeId, snapshot_inflight: bool) {
        if snapshot_inflight {
            return;
        }
        let snapshot = match self.log.load_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                self.fault(
                    "log compacted but no snapshot stored",
                    RaftError::Internal("missing snapshot".into()),
                );
                return;
            }
            Err(err) => {
                self.fault("loading snapshot for follower", err);
                return;
            }
        };
        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|leader| leader.progress.get_mut(&peer))
        {
            progress.snapshot_inflight = true;
        }

        let term = self.state.hard.current_term;
        let last_included = snapshot.meta.last_included_index;
        let request = InstallSnapshotRequest {
            term,
            leader_id: self.state.id,
            last_included_index: snapshot.meta.last_included_index,
            last_included_term: snapshot.meta.last_included_term,
            data: snapshot.data.clone(),
        };
        info!(
            node_id = self.state.id.0,
            peer = peer.0,
            last_included_index = last_included.0,
            "sending snapshot to lagging follower"
        );

        let transport = Arc::clone(&self.transport);
        let command_tx = self.command_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let response =
                match time::timeout(rpc_timeout, transport.install_snapshot(peer, request)).await {
                    Ok(Ok(response)) => Some(response),
                    Ok(Err(err)) => {
                        trace!(peer = peer.0, error = %err, "install snapshot failed");
                        None
                    }
                    Err(_) => {
                        trace!(peer = peer.0, "install snapshot timed out");
                        None
                    }
                };
            // Always report back so the in-flight flag clears
            let _ = command_tx.send(RaftCommand::SnapshotReply {
                peer,
                request_term: term,
                last_included,
                response,
            });
        });
    }

    fn handle_append_reply(
        &mut self,
        peer: NodeId,
        request_term: Term,
        prev_log_index: LogIndex,
        sent: usize,
        response: AppendEntriesResponse,
    ) {
        if response.term > self.state.hard.current_term {
            self.step_down(response.term, None);
            return;
        }
        if self.state.role != RaftRole::Leader || request_term != self.state.hard.current_term {
            return;
        }

        let mut retry = false;
        {
            let Some(progress) = self
                .state
                .leader
                .as_mut()
                .and_then(|leader| leader.progress.get_mut(&peer))
            else {
                return;
            };

            if response.success {
                let matched = prev_log_index + sent as u64;
                if matched > progress.match_index {
                    progress.match_index = matched;
                }
                if matched + 1 > progress.next_index {
                    progress.next_index = matched + 1;
                }
            } else {
                // Log mismatch: back off next_index, using the follower's
                // hint to skip most of the walk
                let fallback = progress.next_index.0.saturating_sub(1).max(1);
                let next = match response.match_index {
                    Some(hint) => (hint.0 + 1).min(fallback),
                    None => fallback,
                }
                .max(1);
                // Only retry immediately when we moved; otherwise wait for
                // the next heartbeat so a stuck follower can't spin us
                retry = next < progress.next_index.0;
                progress.next_index = LogIndex(next);
            }
        }

        if response.success {
            self.advance_commit();
            // Keep streaming while the follower is still behind
            let behind = self
                .state
                .leader
                .as_ref()
                .and_then(|leader| leader.progress.get(&peer))
                .map(|progress| progress.next_index <= self.log.last_index())
                .unwrap_or(false);
            if sent > 0 && behind {
                self.replicate_to(peer);
            }
        } else if retry {
            self.replicate_to(peer);
        }
    }

    fn handle_snapshot_reply(
        &mut self,
        peer: NodeId,
        request_term: Term,
        last_included: LogIndex,
        response: Option<InstallSnapshotResponse>,
    ) {
        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|leader| leader.progress.get_mut(&peer))
        {
            progress.snapshot_inflight = false;
        }

        let Some(response) = response else {
            return;
        };
        if response.term > self.state.hard.current_term {
            self.step_down(response.term, None);
            return;
        }
        if self.state.role != RaftRole::Leader || request_term != self.state.hard.current_term {
            return;
        }

        if let Some(progress) = self
            .state
            .leader
            .as_mut()
            .and_then(|leader| leader.progress.get_mut(&peer))
        {
            if last_included > progress.match_index {
                progress.match_index = last_included;
            }
            if last_included + 1 > progress.next_index {
                progress.next_index = last_included + 1;
            }
        }
    }

    /// Advance the commit index to the highest entry from the current
    /// term that a majority has durably stored. Entries from previous
    /// terms commit only indirectly, through a later current-term entry.
    fn advance_commit(&mut self) {
        if self.state.role != RaftRole::Leader {
            return;
        }
        let majority = self.state.majority();
        let mut indices: Vec<u64> = match self.state.leader.as_ref() {
            Some(leader) => leader
                .progress
                .values()
                .map(|progress| progress.match_index.0)
                .collect(),
            None => return,
        };
        indices.push(self.log.last_index().0);
        indices.sort_unstable();

        let candidate = LogIndex(indices[indices.len() - majority]);
        if candidate <= self.state.commit_index {
            return;
        }
        match self.log.term_at(candidate) {
            Ok(Some(term)) if term == self.state.hard.current_term => {
                debug!(
                    node_id = self.state.id.0,
                    commit_index = candidate.0,
                    "advancing commit index"
                );
                self.state.commit_index = candidate;
                self.apply_committed();
            }
            Ok(_) => {}
            Err(err) => self.fault("reading term for commit advancement", err),
        }
    }

    // ---- application --------------------------------------------------

    /// Apply entries up to the commit index, in order, exactly once.
    fn apply_committed(&mut self) {
        while self.state.last_applied < self.state.commit_index {
            let next = self.state.last_applied + 1;
            let entry = match self.log.entry(next) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.fault(
                        "committed entry missing from log",
                        RaftError::LogIndexOutOfRange(next),
                    );
                    return;
                }
                Err(err) => {
                    self.fault("reading committed entry", err);
                    return;
                }
            };

            let result = self.state_machine.apply(&entry.command);
            self.state.last_applied = next;
            trace!(
                node_id = self.state.id.0,
                index = next.0,
                term = entry.term.0,
                "applied entry"
            );

            if let Some(waiter) = self.waiters.remove(&next.0) {
                let outcome = if waiter.term == entry.term {
                    Ok(result.clone())
                } else {
                    // A different leader's entry landed at this index
                    Err(RaftError::NotLeader(self.state.leader_id))
                };
                let _ = waiter.tx.send(outcome);
            }

            let _ = self.apply_tx.send(AppliedEntry {
                index: next,
                term: entry.term,
                command: entry.command,
                result,
            });
        }

        self.maybe_snapshot();
    }

    fn maybe_snapshot(&mut self) {
        if !self.snapshots.should_snapshot(self.state.last_applied) {
            return;
        }
        if let Err(err) =
            self.snapshots
                .create(&mut self.log, &self.state_machine, self.state.last_applied)
        {
            self.fault("creating snapshot", err);
        }
    }

    // ---- RPC handlers (receiver side) ---------------------------------

    fn handle_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        if self.faulted {
            return RequestVoteResponse {
                term: self.state.hard.current_term,
                vote_granted: false,
            };
        }

        let mut dirty = false;
        if request.term > self.state.hard.current_term {
            self.follow(request.term, None);
            dirty = true;
        }

        let mut vote_granted = false;
        if request.term >= self.state.hard.current_term {
            let can_vote = match self.state.hard.voted_for {
                None => true,
                Some(candidate) => candidate == request.candidate_id,
            };
            if can_vote
                && self
                    .log
                    .candidate_up_to_date(request.last_log_term, request.last_log_index)
            {
                vote_granted = true;
                if self.state.hard.voted_for != Some(request.candidate_id) {
                    self.state.hard.voted_for = Some(request.candidate_id);
                    dirty = true;
                }
                self.reset_election_deadline();
                debug!(
                    node_id = self.state.id.0,
                    candidate = request.candidate_id.0,
                    term = request.term.0,
                    "granted vote"
                );
            }
        }

        // The vote must be durable before the response leaves
        if dirty && !self.persist_hard_state() {
            vote_granted = false;
        }

        RequestVoteResponse {
            term: self.state.hard.current_term,
            vote_granted,
        }
    }

    fn handle_append_entries(&mut self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let reject = |term: Term, hint: Option<LogIndex>| AppendEntriesResponse {
            term,
            success: false,
            match_index: hint,
        };

        if self.faulted {
            return reject(self.state.hard.current_term, None);
        }
        if request.term < self.state.hard.current_term {
            return reject(self.state.hard.current_term, None);
        }

        // Valid leader at current-or-higher term: follow it
        let term_advanced = request.term > self.state.hard.current_term;
        if term_advanced || self.state.role != RaftRole::Follower {
            self.follow(request.term, Some(request.leader_id));
        }
        self.state.leader_id = Some(request.leader_id);
        self.reset_election_deadline();
        if term_advanced && !self.persist_hard_state() {
            return reject(self.state.hard.current_term, None);
        }

        // Log-matching check at (prev_log_index, prev_log_term). Anything
        // at or below the compaction boundary is committed and matches.
        let prev = request.prev_log_index;
        let prev_ok = if prev == LogIndex::ZERO || prev <= self.log.compacted_index() {
            true
        } else {
            match self.log.term_at(prev) {
                Ok(term) => term == Some(request.prev_log_term),
                Err(err) => {
                    self.fault("reading prev term", err);
                    return reject(self.state.hard.current_term, None);
                }
            }
        };
        if !prev_ok {
            let hint = LogIndex(self.log.last_index().0.min(prev.0.saturating_sub(1)));
            return reject(self.state.hard.current_term, Some(hint));
        }

        let last_new_index = request.entries.last().map(|e| e.index).unwrap_or(prev);

        // Skip entries we already hold with the same term (duplicate or
        // reordered delivery must not truncate), cut at the first real
        // conflict, append the rest.
        let mut entries = request.entries;
        let mut start = 0;
        while start < entries.len() {
            let entry = &entries[start];
            if entry.index <= self.log.compacted_index() {
                start += 1;
                continue;
            }
            match self.log.term_at(entry.index) {
                Ok(Some(existing)) if existing == entry.term => start += 1,
                Ok(Some(_)) => {
                    if let Err(err) = self.log.truncate_from(entry.index) {
                        self.fault("truncating conflicting entries", err);
                        return reject(self.state.hard.current_term, None);
                    }
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    self.fault("checking entry for conflict", err);
                    return reject(self.state.hard.current_term, None);
                }
            }
        }
        if start < entries.len() {
            let to_append = entries.split_off(start);
            if let Err(err) = self.log.append(to_append) {
                self.fault("appending replicated entries", err);
                return reject(self.state.hard.current_term, None);
            }
        }

        if request.leader_commit > self.state.commit_index {
            let new_commit = LogIndex(request.leader_commit.0.min(last_new_index.0));
            if new_commit > self.state.commit_index {
                self.state.commit_index = new_commit;
            }
        }

        AppendEntriesResponse {
            term: self.state.hard.current_term,
            success: true,
            match_index: Some(self.log.last_index()),
        }
    }

    fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        if self.faulted || request.term < self.state.hard.current_term {
            return InstallSnapshotResponse {
                term: self.state.hard.current_term,
            };
        }

        let term_advanced = request.term > self.state.hard.current_term;
        if term_advanced || self.state.role != RaftRole::Follower {
            self.follow(request.term, Some(request.leader_id));
        }
        self.state.leader_id = Some(request.leader_id);
        self.reset_election_deadline();
        if term_advanced && !self.persist_hard_state() {
            return InstallSnapshotResponse {
                term: self.state.hard.current_term,
            };
        }

        let last_included = request.last_included_index;
        // A snapshot that doesn't move us forward is stale; ignore it
        if last_included <= self.state.commit_index
            || last_included <= self.log.compacted_index()
        {
            debug!(
                node_id = self.state.id.0,
                last_included_index = last_included.0,
                "ignoring stale snapshot"
            );
            return InstallSnapshotResponse {
                term: self.state.hard.current_term,
            };
        }

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: last_included,
                last_included_term: request.last_included_term,
            },
            data: request.data,
        };
        match self
            .snapshots
            .install(&mut self.log, &mut self.state_machine, &snapshot)
        {
            Ok(()) => {
                self.state.commit_index = last_included;
                self.state.last_applied = last_included;
            }
            Err(err) => self.fault("installing snapshot", err),
        }

        InstallSnapshotResponse {
            term: self.state.hard.current_term,
        }
    }
}
