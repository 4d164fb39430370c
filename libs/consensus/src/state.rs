//! Raft node state and role management

use crate::types::{HardState, LogIndex, NodeId, Term};
use std::collections::{HashMap, HashSet};

/// The role a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    /// Follower - accepts log entries from a leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - accepts client commands and replicates the log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Replication progress a leader tracks for one follower
#[derive(Debug, Clone)]
pub struct Progress {
    /// Index of the next log entry to send
    pub next_index: LogIndex,

    /// Highest log entry known to be replicated on the follower
    pub match_index: LogIndex,

    /// An InstallSnapshot RPC is outstanding; don't send another until it
    /// resolves or times out
    pub snapshot_inflight: bool,
}

impl Progress {
    fn new(last_log_index: LogIndex) -> Self {
        Self {
            next_index: last_log_index + 1,
            match_index: LogIndex::ZERO,
            snapshot_inflight: false,
        }
    }
}

/// Volatile state on leaders (reinitialized after election)
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub progress: HashMap<NodeId, Progress>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            progress: peers
                .iter()
                .map(|&id| (id, Progress::new(last_log_index)))
                .collect(),
        }
    }
}

/// Candidate-specific state
#[derive(Debug, Clone)]
pub struct CandidateState {
    /// Nodes that have granted votes in this election (includes self)
    pub votes_received: HashSet<NodeId>,
}

impl CandidateState {
    fn new(own_id: NodeId) -> Self {
        let mut votes_received = HashSet::new();
        votes_received.insert(own_id);
        Self { votes_received }
    }
}

/// Complete Raft node state
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// This node's ID
    pub id: NodeId,

    /// Current leader (if known)
    pub leader_id: Option<NodeId>,

    /// Durable state (term and vote); the log lives in storage
    pub hard: HardState,

    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,

    /// Index of highest log entry applied to the state machine
    pub last_applied: LogIndex,

    /// Leader-specific state (only valid when role == Leader)
    pub leader: Option<LeaderState>,

    /// Candidate-specific state (only valid when role == Candidate)
    pub candidate: Option<CandidateState>,

    /// All nodes in the cluster (including self)
    pub peers: Vec<NodeId>,
}

impl NodeState {
    pub fn new(id: NodeId, peers: Vec<NodeId>, hard: HardState) -> Self {
        Self {
            role: RaftRole::Follower,
            id,
            leader_id: None,
            hard,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            leader: None,
            candidate: None,
            peers,
        }
    }

    /// Number of nodes that constitutes a majority of the cluster
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// Transition to follower. Clears the vote only when the term actually
    /// advances; a vote already cast in the current term must stand.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.hard.current_term {
            self.hard.current_term = term;
            self.hard.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.leader = None;
        self.candidate = None;
    }

    /// Transition to candidate: new term, vote for self
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.hard.current_term.increment();
        self.hard.voted_for = Some(self.id);
        self.leader_id = None;
        self.candidate = Some(CandidateState::new(self.id));
        self.leader = None;
    }

    /// Transition to leader for the current term
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.leader = Some(LeaderState::new(&self.other_peers(), last_log_index));
        self.candidate = None;
    }

    /// Record a granted vote; true once a majority (including self) is in
    pub fn record_vote(&mut self, from: NodeId) -> bool {
        let majority = self.majority();
        match self.candidate.as_mut() {
            Some(candidate) => {
                candidate.votes_received.insert(from);
                candidate.votes_received.len() >= majority
            }
            None => false,
        }
    }

    /// Get other peers (excluding self)
    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|&&p| p != self.id)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_state() -> NodeState {
        let peers = vec![NodeId(1), NodeId(2), NodeId(3)];
        NodeState::new(NodeId(1), peers, HardState::default())
    }

    #[test]
    fn state_transitions() {
        let mut state = three_node_state();

        assert_eq!(state.role, RaftRole::Follower);

        state.become_candidate();
        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.hard.current_term, Term(1));
        assert_eq!(state.hard.voted_for, Some(NodeId(1)));
        assert!(state.candidate.is_some());

        state.become_leader(LogIndex(10));
        assert_eq!(state.role, RaftRole::Leader);
        assert!(state.leader.is_some());
        assert!(state.candidate.is_none());

        state.become_follower(Term(2), Some(NodeId(2)));
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.hard.current_term, Term(2));
        assert_eq!(state.leader_id, Some(NodeId(2)));
        assert!(state.leader.is_none());
    }

    #[test]
    fn follower_transition_preserves_vote_within_term() {
        let mut state = three_node_state();
        state.become_candidate();
        assert_eq!(state.hard.voted_for, Some(NodeId(1)));

        // Same term: the vote stands
        state.become_follower(Term(1), None);
        assert_eq!(state.hard.voted_for, Some(NodeId(1)));

        // Higher term: vote is cleared
        state.become_follower(Term(2), None);
        assert_eq!(state.hard.voted_for, None);
    }

    #[test]
    fn vote_counting() {
        let mut state = three_node_state();
        state.become_candidate();

        // Self vote alone is not a majority of 3
        assert!(!state.record_vote(NodeId(1)));
        // One peer vote makes 2 of 3
        assert!(state.record_vote(NodeId(2)));
    }

    #[test]
    fn vote_counting_five_nodes() {
        let peers = (1..=5).map(NodeId).collect();
        let mut state = NodeState::new(NodeId(1), peers, HardState::default());
        state.become_candidate();

        assert!(!state.record_vote(NodeId(2)));
        // Duplicate grants don't double count
        assert!(!state.record_vote(NodeId(2)));
        assert!(state.record_vote(NodeId(3)));
    }

    #[test]
    fn leader_progress_initialized_past_log() {
        let mut state = three_node_state();
        state.become_candidate();
        state.become_leader(LogIndex(10));

        let leader = state.leader.as_ref().unwrap();
        let progress = &leader.progress[&NodeId(2)];
        assert_eq!(progress.next_index, LogIndex(11));
        assert_eq!(progress.match_index, LogIndex::ZERO);
    }
}
