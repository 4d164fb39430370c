//! Safety checkers over recorded histories and log dumps.
//!
//! The linearizability check exploits that committed commands already
//! have a total order (their log index): it verifies that every node
//! observed the same command and result at every index, then replays the
//! committed prefix through a model state machine and requires every
//! recorded result to match the model's. If that holds, the recorded
//! responses are exactly those of one sequential execution.

use crate::kv::{apply_to_model, KvCommand};
use keelson_consensus::{AppliedEntry, Entry, LogDump, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Applied entries per node, one inner vec per incarnation.
pub type Histories = HashMap<NodeId, Vec<Vec<AppliedEntry>>>;

#[derive(Debug, thiserror::Error)]
pub enum Violation {
    #[error("node {node} applied index {next} after {prev} within one incarnation")]
    OutOfOrderApply { node: NodeId, prev: u64, next: u64 },

    #[error("two different commands committed at index {index}")]
    CommandMismatch { index: u64 },

    #[error("nodes recorded different results at index {index}")]
    ResultMismatch { index: u64 },

    #[error("undecodable command at index {index}")]
    BadCommand { index: u64 },

    #[error("recorded result at index {index} does not match the sequential replay")]
    NotLinearizable { index: u64 },
}

/// Check every recorded history for apply-order, agreement, and
/// linearizability violations.
pub fn check_histories(histories: &Histories) -> Result<(), Violation> {
    // Within one incarnation a node applies strictly in index order;
    // re-applying after a restart is a new incarnation and is fine.
    for (&node, incarnations) in histories {
        for incarnation in incarnations {
            for window in incarnation.windows(2) {
                if window[1].index.0 <= window[0].index.0 {
                    return Err(Violation::OutOfOrderApply {
                        node,
                        prev: window[0].index.0,
                        next: window[1].index.0,
                    });
                }
            }
        }
    }

    // State-machine safety: one command (and one result) per index,
    // across every node and incarnation.
    let mut by_index: BTreeMap<u64, &AppliedEntry> = BTreeMap::new();
    for incarnations in histories.values() {
        for incarnation in incarnations {
            for entry in incarnation {
                match by_index.get(&entry.index.0) {
                    Some(existing) => {
                        if existing.command != entry.command {
                            return Err(Violation::CommandMismatch {
                                index: entry.index.0,
                            });
                        }
                        if existing.result != entry.result {
                            return Err(Violation::ResultMismatch {
                                index: entry.index.0,
                            });
                        }
                    }
                    None => {
                        by_index.insert(entry.index.0, entry);
                    }
                }
            }
        }
    }

    // Replay the contiguous committed prefix through the model; every
    // recorded result must be the one a sequential execution produces.
    let mut model = HashMap::new();
    let mut expected_index = 1u64;
    for (&index, entry) in &by_index {
        if index != expected_index {
            // A gap means earlier indices were applied only inside a
            // snapshot; replay cannot cross it.
            break;
        }
        let command = KvCommand::decode(&entry.command)
            .ok_or(Violation::BadCommand { index })?;
        let expected = apply_to_model(&mut model, &command);
        if expected != entry.result {
            return Err(Violation::NotLinearizable { index });
        }
        expected_index += 1;
    }

    Ok(())
}

/// Panic with the violation if the histories fail any check.
pub fn assert_linearizable(histories: &Histories) {
    if let Err(violation) = check_histories(histories) {
        panic!("history check failed: {violation}");
    }
}

/// State-machine safety alone: no two different commands at one index.
pub fn assert_state_machine_safety(histories: &Histories) {
    let mut by_index: HashMap<u64, &AppliedEntry> = HashMap::new();
    for incarnations in histories.values() {
        for incarnation in incarnations {
            for entry in incarnation {
                if let Some(existing) = by_index.get(&entry.index.0) {
                    assert_eq!(
                        existing.command, entry.command,
                        "different commands committed at index {}",
                        entry.index.0
                    );
                    assert_eq!(
                        existing.result, entry.result,
                        "result divergence at index {}",
                        entry.index.0
                    );
                } else {
                    by_index.insert(entry.index.0, entry);
                }
            }
        }
    }
}

/// Log Matching Property over retained logs: wherever two nodes hold an
/// entry with the same (index, term), everything both retain at or below
/// that index is identical.
pub fn assert_log_matching(dumps: &HashMap<NodeId, LogDump>) {
    let ids: Vec<NodeId> = dumps.keys().copied().collect();
    for (i, &a) in ids.iter().enumerate() {
        for &b in &ids[i + 1..] {
            let map_a: BTreeMap<u64, &Entry> =
                dumps[&a].entries.iter().map(|e| (e.index.0, e)).collect();
            let map_b: BTreeMap<u64, &Entry> =
                dumps[&b].entries.iter().map(|e| (e.index.0, e)).collect();

            let anchor = map_a
                .iter()
                .rev()
                .find_map(|(&index, entry_a)| match map_b.get(&index) {
                    Some(entry_b) if entry_a.term == entry_b.term => Some(index),
                    _ => None,
                });
            let Some(anchor) = anchor else {
                continue;
            };

            for (&index, entry_a) in map_a.range(..=anchor) {
                if let Some(entry_b) = map_b.get(&index) {
                    assert_eq!(
                        entry_a.term, entry_b.term,
                        "log matching violated between {a} and {b} at index {index} (terms)"
                    );
                    assert_eq!(
                        entry_a.command, entry_b.command,
                        "log matching violated between {a} and {b} at index {index} (commands)"
                    );
                }
            }
        }
    }
}
