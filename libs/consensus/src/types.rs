//! Core types used throughout the Raft implementation

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and ensure safety.
/// Each time a node starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash)]
pub struct Term(pub u64);

impl Term {
    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Index into the Raft log (1-based; 0 means "before the first entry")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was created
    pub term: Term,

    /// The log index for this entry
    pub index: LogIndex,

    /// The command to apply to the state machine
    pub command: Vec<u8>,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// State that must be flushed to stable storage before any RPC response
/// referencing it is sent. Losing this across a crash permits double
/// voting or log divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HardState {
    /// Latest term this server has seen (increases monotonically)
    pub current_term: Term,

    /// Candidate that received this server's vote in the current term
    pub voted_for: Option<NodeId>,
}

/// Snapshot metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of the last entry included in the snapshot
    pub last_included_term: Term,
}

/// A complete snapshot of the state machine
///
/// The blob is shared (`Bytes`) so a leader can hand the same snapshot to
/// several lagging followers without copying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_increment() {
        let mut term = Term(5);
        term.increment();
        assert_eq!(term, Term(6));
    }

    #[test]
    fn log_index_ops() {
        let idx = LogIndex(10);
        assert_eq!(idx + 5, LogIndex(15));
        assert_eq!(idx - 3, LogIndex(7));
        assert_eq!(LogIndex(2) - 5, LogIndex::ZERO);
    }

    #[test]
    fn log_index_ordering() {
        assert!(LogIndex(1) < LogIndex(2));
        assert!(LogIndex(100) > LogIndex(50));
    }

    #[test]
    fn term_ordering() {
        assert!(Term(1) < Term(2));
        assert!(Term(100) > Term(50));
    }
}
