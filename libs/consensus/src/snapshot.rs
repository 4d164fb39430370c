//! Snapshot creation, installation, and log compaction.
//!
//! A snapshot freezes the state machine as of an applied index and
//! replaces the log prefix it covers. Creation keeps a configurable run
//! of trailing entries so slightly-lagging followers can still catch up
//! over AppendEntries instead of needing the whole snapshot.

use crate::log::RaftLog;
use crate::node::StateMachine;
use crate::types::{LogIndex, Snapshot, SnapshotMeta};
use crate::{RaftError, Result};
use bytes::Bytes;
use tracing::info;

pub struct SnapshotManager {
    threshold: u64,
    trailing: u64,
    last_snapshot_index: LogIndex,
}

impl SnapshotManager {
    /// `last_snapshot_index` is the boundary recovered from storage at
    /// startup (ZERO for a fresh node).
    pub fn new(threshold: u64, trailing: u64, last_snapshot_index: LogIndex) -> Self {
        Self {
            threshold,
            trailing,
            last_snapshot_index,
        }
    }

    /// True once enough entries have been applied since the last snapshot.
    /// A threshold of 0 disables automatic snapshotting.
    pub fn should_snapshot(&self, last_applied: LogIndex) -> bool {
        self.threshold > 0
            && last_applied.0.saturating_sub(self.last_snapshot_index.0) >= self.threshold
    }

    /// Freeze the state machine as of `upto` (which must be applied, hence
    /// committed), persist the snapshot, then compact the log keeping
    /// `trailing` entries behind it.
    pub fn create<SM: StateMachine>(
        &mut self,
        log: &mut RaftLog,
        state_machine: &SM,
        upto: LogIndex,
    ) -> Result<SnapshotMeta> {
        let term = log
            .term_at(upto)?
            .ok_or(RaftError::LogIndexOutOfRange(upto))?;
        let meta = SnapshotMeta {
            last_included_index: upto,
            last_included_term: term,
        };
        let snapshot = Snapshot {
            meta,
            data: Bytes::from(state_machine.snapshot()),
        };
        log.save_snapshot(&snapshot)?;

        let compact_to = upto - self.trailing;
        if compact_to > log.compacted_index() {
            let boundary_term = log
                .term_at(compact_to)?
                .ok_or(RaftError::LogIndexOutOfRange(compact_to))?;
            log.compact_through(compact_to, boundary_term)?;
        }

        self.last_snapshot_index = upto;
        info!(
            last_included_index = upto.0,
            last_included_term = term.0,
            compacted_through = log.compacted_index().0,
            "created snapshot"
        );
        Ok(meta)
    }

    /// Install a snapshot received from the leader: reset the log around
    /// it and restore the state machine from the blob. Callers have
    /// already rejected stale snapshots.
    pub fn install<SM: StateMachine>(
        &mut self,
        log: &mut RaftLog,
        state_machine: &mut SM,
        snapshot: &Snapshot,
    ) -> Result<()> {
        log.install_snapshot(snapshot)?;
        state_machine.restore(&snapshot.data);
        self.last_snapshot_index = snapshot.meta.last_included_index;
        info!(
            last_included_index = snapshot.meta.last_included_index.0,
            last_included_term = snapshot.meta.last_included_term.0,
            "installed snapshot"
        );
        Ok(())
    }
}
