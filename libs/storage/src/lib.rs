//! # keelson-storage
//!
//! Durable, crash-consistent file-backed storage for a Raft node.
//!
//! Layout, one directory per node:
//! - `meta.json` — hard state (term + vote), written atomically via a
//!   temp file, fsync, and rename.
//! - `snapshot.bin` — the latest snapshot, written atomically.
//! - `log.bin` — a checksummed header frame carrying the compaction
//!   boundary, followed by one checksummed frame per log entry. Appends
//!   write frames and `sync_data` before returning; truncation shrinks
//!   the file to a frame boundary; compaction rewrites the file
//!   atomically with a new header.
//!
//! A crash mid-append leaves a torn frame at the tail; reload verifies
//! length and checksum frame by frame and discards everything from the
//! first bad frame on. An incomplete entry is never surfaced.

use keelson_consensus::{Entry, HardState, LogIndex, RaftError, Result, Snapshot, Storage, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Frame header: payload length plus a truncated blake3 checksum.
const FRAME_OVERHEAD: usize = 4 + 8;

/// The first frame of `log.bin`: where the retained log begins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct Boundary {
    index: LogIndex,
    term: Term,
}

/// File-backed [`Storage`] implementation.
///
/// Entries and offsets are cached in memory; reads never touch the disk
/// after open. All writes are durable before returning.
pub struct FileStore {
    dir: PathBuf,
    log_file: File,
    /// Byte length of the valid portion of `log.bin`
    log_len: u64,
    /// File offset of each retained entry's frame
    offsets: Vec<u64>,
    entries: Vec<Entry>,
    boundary: Boundary,
    hard: HardState,
    snapshot: Option<Snapshot>,
}

impl FileStore {
    /// Open (or create) the store at `dir`, recovering state from disk.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let hard = match read_file_opt(&dir.join("meta.json"))? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|err| RaftError::Internal(format!("corrupt meta.json: {err}")))?,
            None => HardState::default(),
        };

        let snapshot = match read_file_opt(&dir.join("snapshot.bin"))? {
            Some(raw) => Some(bincode::deserialize(&raw)?),
            None => None,
        };

        let log_path = dir.join("log.bin");
        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let mut raw = Vec::new();
        log_file.read_to_end(&mut raw)?;

        let mut store = Self {
            dir,
            log_file,
            log_len: 0,
            offsets: Vec::new(),
            entries: Vec::new(),
            boundary: Boundary::default(),
            hard,
            snapshot,
        };
        store.recover_log(&raw)?;
        Ok(store)
    }

    /// Parse `log.bin`, discarding a torn or corrupt tail (fails closed).
    fn recover_log(&mut self, raw: &[u8]) -> Result<()> {
        let mut cursor = 0u64;

        match decode_frame(raw, cursor) {
            Some((payload, next)) => {
                self.boundary = bincode::deserialize(payload)?;
                cursor = next;
            }
            None => {
                // Empty or unreadable header: start a fresh log
                if !raw.is_empty() {
                    warn!("log header unreadable; starting with an empty log");
                }
                self.rewrite_log(Boundary::default(), Vec::new())?;
                return Ok(());
            }
        }

        let mut expected = self.boundary.index + 1;
        while let Some((payload, next)) = decode_frame(raw, cursor) {
            let entry: Entry = match bincode::deserialize(payload) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(offset = cursor, error = %err, "undecodable entry frame; truncating tail");
                    break;
                }
            };
            if entry.index != expected {
                warn!(
                    offset = cursor,
                    index = entry.index.0,
                    expected = expected.0,
                    "out-of-sequence entry; truncating tail"
                );
                break;
            }
            self.offsets.push(cursor);
            self.entries.push(entry);
            expected = expected + 1;
            cursor = next;
        }

        if cursor < raw.len() as u64 {
            debug!(
                valid = cursor,
                total = raw.len(),
                "discarding torn log tail"
            );
            self.log_file.set_len(cursor)?;
            self.log_file.sync_data()?;
        }
        self.log_len = cursor;
        Ok(())
    }

    /// Atomically replace `log.bin` with a new header and entry set.
    fn rewrite_log(&mut self, boundary: Boundary, entries: Vec<Entry>) -> Result<()> {
        let log_path = self.dir.join("log.bin");
        let tmp_path = self.dir.join("log.bin.tmp");

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        encode_frame(&mut buf, &bincode::serialize(&boundary)?);
        for entry in &entries {
            offsets.push(buf.len() as u64);
            encode_frame(&mut buf, &bincode::serialize(entry)?);
        }

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &log_path)?;

        self.log_file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        self.log_len = buf.len() as u64;
        self.offsets = offsets;
        self.entries = entries;
        self.boundary = boundary;
        Ok(())
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        if index <= self.boundary.index || index > self.last_index() {
            return None;
        }
        Some((index.0 - self.boundary.index.0 - 1) as usize)
    }
}

impl Storage for FileStore {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        if let Some(first) = entries.first() {
            if first.index != self.last_index() + 1 {
                return Err(RaftError::LogIndexOutOfRange(first.index));
            }
        } else {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(self.log_len + buf.len() as u64);
            encode_frame(&mut buf, &bincode::serialize(entry)?);
        }

        use std::io::Seek;
        self.log_file.seek(std::io::SeekFrom::Start(self.log_len))?;
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;

        self.log_len += buf.len() as u64;
        self.offsets.extend(offsets);
        self.entries.extend(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.boundary.index {
            return Err(RaftError::LogIndexOutOfRange(index));
        }
        let Some(pos) = self.position(index) else {
            return Ok(());
        };

        let cut = self.offsets[pos];
        self.log_file.set_len(cut)?;
        self.log_file.sync_data()?;

        self.log_len = cut;
        self.offsets.truncate(pos);
        self.entries.truncate(pos);
        Ok(())
    }

    fn entry(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self.position(index).map(|pos| self.entries[pos].clone()))
    }

    fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        if start <= self.boundary.index {
            return Err(RaftError::LogIndexOutOfRange(start));
        }
        match self.position(start) {
            Some(pos) => Ok(self.entries[pos..].iter().take(max).cloned().collect()),
            None => Ok(vec![]),
        }
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == self.boundary.index && index > LogIndex::ZERO {
            return Ok(Some(self.boundary.term));
        }
        Ok(self.position(index).map(|pos| self.entries[pos].term))
    }

    fn last_index(&self) -> LogIndex {
        match self.entries.last() {
            Some(entry) => entry.index,
            None => self.boundary.index,
        }
    }

    fn last_term(&self) -> Term {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.boundary.term,
        }
    }

    fn compacted_index(&self) -> LogIndex {
        self.boundary.index
    }

    fn compacted_term(&self) -> Term {
        self.boundary.term
    }

    fn compact_through(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.boundary.index {
            return Ok(());
        }
        let Some(pos) = self.position(index) else {
            return Err(RaftError::LogIndexOutOfRange(index));
        };
        let retained = self.entries[pos + 1..].to_vec();
        self.rewrite_log(Boundary { index, term }, retained)
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.save_snapshot(snapshot)?;

        let meta = snapshot.meta;
        let retained = match self
            .position(meta.last_included_index)
            .filter(|&pos| self.entries[pos].term == meta.last_included_term)
        {
            Some(pos) => self.entries[pos + 1..].to_vec(),
            None => Vec::new(),
        };
        self.rewrite_log(
            Boundary {
                index: meta.last_included_index,
                term: meta.last_included_term,
            },
            retained,
        )
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|err| RaftError::Internal(format!("encoding hard state: {err}")))?;
        write_atomic(&self.dir, "meta.json", &raw)?;
        self.hard = *state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let raw = bincode::serialize(snapshot)?;
        write_atomic(&self.dir, "snapshot.bin", &raw)?;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

/// Append one `[len][checksum][payload]` frame to `buf`.
fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum(payload));
    buf.extend_from_slice(payload);
}

/// Decode the frame at `offset`; `None` if it is torn or corrupt.
fn decode_frame(raw: &[u8], offset: u64) -> Option<(&[u8], u64)> {
    let start = offset as usize;
    if raw.len() < start + FRAME_OVERHEAD {
        return None;
    }
    let len = u32::from_le_bytes(raw[start..start + 4].try_into().ok()?) as usize;
    let payload_start = start + FRAME_OVERHEAD;
    let payload_end = payload_start.checked_add(len)?;
    if raw.len() < payload_end {
        return None;
    }
    let payload = &raw[payload_start..payload_end];
    if checksum(payload)[..] != raw[start + 4..start + 12] {
        return None;
    }
    Some((payload, payload_end as u64))
}

/// Truncated blake3 of the payload; enough to catch torn writes.
fn checksum(payload: &[u8]) -> [u8; 8] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    out
}

fn write_atomic(dir: &Path, name: &str, raw: &[u8]) -> Result<()> {
    let tmp_path = dir.join(format!("{name}.tmp"));
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(raw)?;
    tmp.sync_all()?;
    drop(tmp);
    fs::rename(&tmp_path, dir.join(name))?;
    Ok(())
}

fn read_file_opt(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelson_consensus::{NodeId, SnapshotMeta};
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> Entry {
        Entry::new(Term(term), LogIndex(index), format!("cmd{index}").into_bytes())
    }

    #[test]
    fn hard_state_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .save_hard_state(&HardState {
                    current_term: Term(7),
                    voted_for: Some(NodeId(3)),
                })
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let hard = store.load_hard_state().unwrap();
        assert_eq!(hard.current_term, Term(7));
        assert_eq!(hard.voted_for, Some(NodeId(3)));
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .append(vec![entry(1, 1), entry(1, 2), entry(2, 3)])
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), LogIndex(3));
        assert_eq!(store.last_term(), Term(2));
        assert_eq!(store.entry(LogIndex(2)).unwrap().unwrap().command, b"cmd2");
    }

    #[test]
    fn truncation_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .append(vec![entry(1, 1), entry(1, 2), entry(1, 3)])
                .unwrap();
            store.truncate_from(LogIndex(2)).unwrap();
            store.append(vec![entry(2, 2)]).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), LogIndex(2));
        assert_eq!(store.term_at(LogIndex(2)).unwrap(), Some(Term(2)));
    }

    #[test]
    fn torn_tail_discarded_on_reload() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log.bin");

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .append(vec![entry(1, 1), entry(1, 2), entry(1, 3)])
                .unwrap();
        }

        // Crash mid-append: the last frame is cut short
        let raw = fs::read(&log_path).unwrap();
        let mut file = OpenOptions::new().write(true).open(&log_path).unwrap();
        file.set_len(raw.len() as u64 - 5).unwrap();
        drop(file);

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), LogIndex(2));
        assert_eq!(store.entry(LogIndex(2)).unwrap().unwrap().command, b"cmd2");
        assert!(store.entry(LogIndex(3)).unwrap().is_none());

        // The store keeps working after recovery
        let mut store = store;
        store.append(vec![entry(2, 3)]).unwrap();
        assert_eq!(store.last_index(), LogIndex(3));
    }

    #[test]
    fn corrupt_tail_discarded_on_reload() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log.bin");

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.append(vec![entry(1, 1), entry(1, 2)]).unwrap();
        }

        // Flip a byte inside the last entry's payload
        let mut raw = fs::read(&log_path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&log_path, &raw).unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), LogIndex(1));
    }

    #[test]
    fn compaction_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .append(vec![entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)])
                .unwrap();
            store.compact_through(LogIndex(2), Term(1)).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.compacted_index(), LogIndex(2));
        assert_eq!(store.compacted_term(), Term(1));
        assert_eq!(store.term_at(LogIndex(2)).unwrap(), Some(Term(1)));
        assert!(store.entry(LogIndex(2)).unwrap().is_none());
        assert_eq!(store.entry(LogIndex(3)).unwrap().unwrap().command, b"cmd3");
        assert_eq!(store.last_index(), LogIndex(4));
    }

    #[test]
    fn snapshot_round_trip_and_install() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: LogIndex(5),
                last_included_term: Term(2),
            },
            data: bytes::Bytes::from_static(b"machine-state"),
        };

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store
                .append(vec![entry(1, 1), entry(1, 2), entry(1, 3)])
                .unwrap();
            // Snapshot ahead of everything we hold: log resets
            store.install_snapshot(&snapshot).unwrap();
            assert_eq!(store.last_index(), LogIndex(5));
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_snapshot().unwrap().unwrap(), snapshot);
        assert_eq!(store.compacted_index(), LogIndex(5));
        assert_eq!(store.last_term(), Term(2));
    }

    #[test]
    fn append_rejects_gaps() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.append(vec![entry(1, 1)]).unwrap();
        assert!(store.append(vec![entry(1, 5)]).is_err());
    }

    mod model_equivalence {
        use super::*;
        use keelson_consensus::MemoryStore;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Append { term: u64, count: u8 },
            TruncateBack { back: u8 },
            CompactKeep { keep: u8 },
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1u64..5, 1u8..4).prop_map(|(term, count)| Op::Append { term, count }),
                (0u8..4).prop_map(|back| Op::TruncateBack { back }),
                (0u8..3).prop_map(|keep| Op::CompactKeep { keep }),
            ]
        }

        /// Drive a FileStore and a MemoryStore through the same operation
        /// sequence (with a reopen between every step) and require their
        /// observable log state to stay identical.
        fn run_ops(dir: &Path, ops: Vec<Op>) {
            let mut model = MemoryStore::new();
            for op in ops {
                let mut store = FileStore::open(dir).unwrap();
                match op {
                    Op::Append { term, count } => {
                        let next = store.last_index().0 + 1;
                        let entries: Vec<Entry> = (next..next + count as u64)
                            .map(|i| entry(term, i))
                            .collect();
                        store.append(entries.clone()).unwrap();
                        model.append(entries).unwrap();
                    }
                    Op::TruncateBack { back } => {
                        let target = LogIndex(store.last_index().0.saturating_sub(back as u64));
                        if target > store.compacted_index() {
                            store.truncate_from(target).unwrap();
                            model.truncate_from(target).unwrap();
                        }
                    }
                    Op::CompactKeep { keep } => {
                        let target = LogIndex(store.last_index().0.saturating_sub(keep as u64));
                        if target > store.compacted_index() {
                            if let Some(term) = store.term_at(target).unwrap() {
                                store.compact_through(target, term).unwrap();
                                model.compact_through(target, term).unwrap();
                            }
                        }
                    }
                }

                assert_eq!(store.last_index(), model.last_index());
                assert_eq!(store.last_term(), model.last_term());
                assert_eq!(store.compacted_index(), model.compacted_index());
                let first = store.compacted_index() + 1;
                assert_eq!(
                    store.entries_from(first, usize::MAX).unwrap(),
                    model.entries_from(first, usize::MAX).unwrap()
                );
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn file_store_matches_memory_model(ops in proptest::collection::vec(op_strategy(), 1..20)) {
                let dir = tempdir().unwrap();
                run_ops(dir.path(), ops);
            }
        }
    }
}
