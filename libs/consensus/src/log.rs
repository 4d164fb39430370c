//! The node's durable storage: log entries, hard state, and snapshot.
//!
//! The log is the source of truth for all commands that have been
//! proposed. Implementations must make `append` and the hard-state /
//! snapshot writers durable before returning: a response referencing an
//! entry or a vote may only be sent once that data would survive a crash.

use crate::types::{Entry, HardState, LogIndex, Snapshot, Term};
use crate::{RaftError, Result};

/// Durable storage backend for a single Raft node.
///
/// Entries below the compaction boundary have been discarded and are only
/// reachable through the snapshot. `term_at` still answers at the boundary
/// itself so the Log Matching check works across the compaction edge.
pub trait Storage: Send + 'static {
    /// Append entries to the log; durable before return.
    ///
    /// Entries must continue the log contiguously from `last_index()`.
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Delete entries at and after `index` (conflict resolution).
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Get the entry at `index`, if it is retained.
    fn entry(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Up to `max` entries starting at `start`.
    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>>;

    /// Term of the entry at `index`; answers at the compaction boundary,
    /// `None` below it or past the end.
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>>;

    /// Highest index in the log (or the boundary, if the log is empty).
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry (or of the boundary, if the log is empty).
    fn last_term(&self) -> Term;

    /// Index of the last discarded entry (ZERO if nothing was compacted).
    fn compacted_index(&self) -> LogIndex;

    /// Term of the last discarded entry.
    fn compacted_term(&self) -> Term;

    /// Discard entries up to and including `index`, recording `term` as
    /// the new boundary term.
    fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()>;

    /// Replace the log prefix with a snapshot. If a retained entry matches
    /// the snapshot's last included (index, term), the entries after it
    /// are kept; otherwise the whole log is cleared.
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    fn load_hard_state(&self) -> Result<HardState>;

    /// Persist a snapshot without touching the retained log.
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// In-memory storage, for tests and the simulation harness.
///
/// "Durability" is trivially immediate; crash simulation shares one
/// `MemoryStore` across node incarnations instead of reloading files.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Vec<Entry>,
    hard: HardState,
    snapshot: Option<Snapshot>,
    compacted_index: LogIndex,
    compacted_term: Term,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a log index to a position in `entries`.
    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.compacted_index || index > self.last_index() {
            return None;
        }
        Some((index.0 - self.compacted_index.0 - 1) as usize)
    }
}

impl Storage for MemoryStore {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        if let Some(first) = entries.first() {
            if first.index != self.last_index() + 1 {
                return Err(RaftError::LogIndexOutOfRange(first.index));
            }
        }
        self.entries.extend(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.compacted_index {
            return Err(RaftError::LogIndexOutOfRange(index));
        }
        if let Some(pos) = self.position(index) {
            self.entries.truncate(pos);
        }
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self.position(index).map(|pos| self.entries[pos].clone()))
    }

    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        if start <= self.compacted_index {
            return Err(RaftError::LogIndexOutOfRange(start));
        }
        match self.position(start) {
            Some(pos) => Ok(self.entries[pos..].iter().take(max).cloned().collect()),
            None => Ok(vec![]),
        }
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == self.compacted_index && index > LogIndex::ZERO {
            return Ok(Some(self.compacted_term));
        }
        Ok(self.position(index).map(|pos| self.entries[pos].term))
    }

    fn last_index(&self) -> LogIndex {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.compacted_index,
        }
    }

    fn last_term(&self) -> Term {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.compacted_term,
        }
    }

    fn compacted_index(&self) -> LogIndex {
        self.compacted_index
    }

    fn compacted_term(&self) -> Term {
        self.compacted_term
    }

    fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.compacted_index {
            return Ok(());
        }
        let Some(pos) = self.position(index) else {
            return Err(RaftError::LogIndexOutOfRange(index));
        };
        self.entries.drain(..=pos);
        self.compacted_index = index;
        self.compacted_term = term;
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.meta;
        let matching_suffix = self
            .position(meta.last_included_index)
            .filter(|&pos| self.entries[pos].term == meta.last_included_term);

        match matching_suffix {
            Some(pos) => {
                self.entries.drain(..=pos);
            }
            None => self.entries.clear(),
        }
        self.compacted_index = meta.last_included_index;
        self.compacted_term = meta.last_included_term;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard = *state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

/// The node's view of its log: a storage backend plus the comparisons the
/// consensus core needs.
pub struct RaftLog {
    store: Box<dyn Storage>,
}

impl RaftLog {
    pub fn new(store: Box<dyn Storage>) -> Self {
        Self { store }
    }

    pub fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        self.store.append(entries)
    }

    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.store.truncate_from(index)
    }

    pub fn entry(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.store.entry(index)
    }

    pub fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        self.store.entries_from(start, max)
    }

    pub fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        self.store.term_at(index)
    }

    pub fn last_index(&self) -> LogIndex {
        self.store.last_index()
    }

    pub fn last_term(&self) -> Term {
        self.store.last_term()
    }

    pub fn first_index(&self) -> LogIndex {
        self.store.compacted_index() + 1
    }

    pub fn compacted_index(&self) -> LogIndex {
        self.store.compacted_index()
    }

    pub fn compacted_term(&self) -> Term {
        self.store.compacted_term()
    }

    pub fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.store.compact_through(index, term)
    }

    pub fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.store.install_snapshot(snapshot)
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.store.save_hard_state(state)
    }

    pub fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.store.save_snapshot(snapshot)
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        self.store.load_snapshot()
    }

    /// Is a candidate's log at least as up-to-date as ours?
    ///
    /// Compare last terms first, then last indexes (Raft §5.4.1).
    pub fn candidate_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        let our_term = self.last_term();
        let our_index = self.last_index();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotMeta;
    use bytes::Bytes;

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(Term(term), LogIndex(index), format!("cmd{index}").into_bytes())
    }

    fn snapshot(index: u64, term: u64) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_included_index: LogIndex(index),
                last_included_term: Term(term),
            },
            data: Bytes::from_static(b"snapshot_data"),
        }
    }

    #[test]
    fn append_and_get() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();

        assert_eq!(store.last_index(), LogIndex(3));
        assert_eq!(store.last_term(), Term(2));

        let got = store.entry(LogIndex(2)).unwrap().unwrap();
        assert_eq!(got.command, b"cmd2");
        assert_eq!(got.term, Term(1));
    }

    #[test]
    fn append_rejects_gaps() {
        let mut store = MemoryStore::new();
        store.append(vec![entry(1, 1)]).unwrap();
        assert!(store.append(vec![entry(1, 3)]).is_err());
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();
        store.truncate_from(LogIndex(2)).unwrap();

        assert_eq!(store.last_index(), LogIndex(1));
        assert!(store.entry(LogIndex(2)).unwrap().is_none());
    }

    #[test]
    fn entries_from_caps_at_max() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();

        let range = store.entries_from(LogIndex(1), 2).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].index, LogIndex(1));
        assert_eq!(range[1].index, LogIndex(2));
    }

    #[test]
    fn compaction_moves_boundary() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();
        store.compact_through(LogIndex(2), Term(1)).unwrap();

        assert_eq!(store.compacted_index(), LogIndex(2));
        assert_eq!(store.last_index(), LogIndex(3));
        assert!(store.entry(LogIndex(1)).unwrap().is_none());
        assert!(store.entry(LogIndex(2)).unwrap().is_none());
        // Boundary term still answers for the log-matching check
        assert_eq!(store.term_at(LogIndex(2)).unwrap(), Some(Term(1)));
        assert_eq!(store.entry(LogIndex(3)).unwrap().unwrap().command, b"cmd3");
    }

    #[test]
    fn install_snapshot_clears_conflicting_log() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(1, 3)])
            .unwrap();

        // Snapshot at index 5: nothing matches, the whole log goes
        store.install_snapshot(&snapshot(5, 3)).unwrap();
        assert_eq!(store.last_index(), LogIndex(5));
        assert_eq!(store.last_term(), Term(3));
        assert!(store.entry(LogIndex(3)).unwrap().is_none());
    }

    #[test]
    fn install_snapshot_retains_matching_suffix() {
        let mut store = MemoryStore::new();
        store
            .append(vec![entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)])
            .unwrap();

        // Snapshot covers a prefix we already hold with the same term
        store.install_snapshot(&snapshot(3, 2)).unwrap();
        assert_eq!(store.compacted_index(), LogIndex(3));
        assert_eq!(store.last_index(), LogIndex(4));
        assert_eq!(store.entry(LogIndex(4)).unwrap().unwrap().term, Term(2));
    }

    #[test]
    fn hard_state_round_trip() {
        let mut store = MemoryStore::new();
        let hard = HardState {
            current_term: Term(5),
            voted_for: Some(crate::NodeId(2)),
        };
        store.save_hard_state(&hard).unwrap();
        assert_eq!(store.load_hard_state().unwrap(), hard);
    }

    #[test]
    fn up_to_date_comparison() {
        let mut log = RaftLog::new(Box::new(MemoryStore::new()));
        log.append(vec![entry(1, 1), entry(2, 2)]).unwrap();

        // Higher last term wins regardless of length
        assert!(log.candidate_up_to_date(Term(3), LogIndex(1)));
        // Same term needs at least our length
        assert!(log.candidate_up_to_date(Term(2), LogIndex(2)));
        assert!(!log.candidate_up_to_date(Term(2), LogIndex(1)));
        // Lower term always loses
        assert!(!log.candidate_up_to_date(Term(1), LogIndex(10)));
    }
}
