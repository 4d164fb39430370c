//! Raft consensus for replicated, strictly-ordered command logs.
//!
//! This library implements the Raft consensus algorithm: leader election
//! with randomized timeouts, log replication with the Log Matching
//! Property, commit advancement under the current-term rule, and log
//! compaction via snapshots installed wholesale on lagging followers.
//!
//! Each node is a single-owner event loop: RPC arrivals, RPC replies,
//! timer firings, and client submissions are all funnelled through one
//! command channel, so every state transition is strictly sequential.
//! Network I/O happens in spawned tasks that only enqueue events.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keelson_consensus::{MemoryStore, NodeId, RaftConfig, RaftNode, StateMachine, Transport};
//!
//! # async fn example<T: Transport>(transport: Arc<T>) -> keelson_consensus::Result<()> {
//! struct Counter(u64);
//!
//! impl StateMachine for Counter {
//!     fn apply(&mut self, _command: &[u8]) -> Vec<u8> {
//!         self.0 += 1;
//!         self.0.to_be_bytes().to_vec()
//!     }
//!     fn snapshot(&self) -> Vec<u8> {
//!         self.0.to_be_bytes().to_vec()
//!     }
//!     fn restore(&mut self, snapshot: &[u8]) {
//!         let mut raw = [0u8; 8];
//!         raw.copy_from_slice(snapshot);
//!         self.0 = u64::from_be_bytes(raw);
//!     }
//! }
//!
//! let peers = vec![NodeId(1), NodeId(2), NodeId(3)];
//! let (node, _applied) = RaftNode::new(
//!     NodeId(1),
//!     peers,
//!     RaftConfig::default(),
//!     Box::new(MemoryStore::new()),
//!     transport,
//!     Counter(0),
//! )?;
//!
//! // Only succeeds on the current leader.
//! let (index, term) = node.submit(b"increment".to_vec()).await?;
//! # let _ = (index, term);
//! # Ok(())
//! # }
//! ```

mod config;
mod log;
mod node;
mod rpc;
mod snapshot;
mod state;
mod transport;
mod types;

pub use config::{RaftConfig, RaftConfigBuilder};
pub use log::{MemoryStore, RaftLog, Storage};
pub use node::{AppliedEntry, ApplyStream, LogDump, NodeStatus, RaftNode, StateMachine};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use snapshot::SnapshotManager;
pub use state::{NodeState, RaftRole};
pub use transport::Transport;
pub use types::{Entry, HardState, LogIndex, NodeId, Snapshot, SnapshotMeta, Term};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Durable storage has failed; node refuses further writes")]
    Faulted,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("RPC timed out")]
    Timeout,

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
