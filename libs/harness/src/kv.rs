//! Key-value test state machine.
//!
//! Deterministic by construction: commands are bincode-encoded, results
//! carry the prior value, so every replica produces identical results for
//! identical command sequences. The linearizability checker replays the
//! same commands through [`apply_to_model`].

use keelson_consensus::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        KvCommand::Get { key: key.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("kv command encodes")
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        bincode::deserialize(raw).ok()
    }
}

/// Decode a result produced by [`KvStore::apply`].
pub fn decode_result(raw: &[u8]) -> Option<Option<String>> {
    bincode::deserialize(raw).ok()
}

/// Apply a command to a bare map; shared by the state machine and the
/// checker's replay. The result is the value the operation observed:
/// the prior value for Put/Delete, the current value for Get.
pub fn apply_to_model(data: &mut HashMap<String, String>, command: &KvCommand) -> Vec<u8> {
    let observed: Option<String> = match command {
        KvCommand::Put { key, value } => data.insert(key.clone(), value.clone()),
        KvCommand::Get { key } => data.get(key).cloned(),
        KvCommand::Delete { key } => data.remove(key),
    };
    bincode::serialize(&observed).expect("kv result encodes")
}

/// Replicated key-value store
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        match KvCommand::decode(command) {
            Some(command) => apply_to_model(&mut self.data, &command),
            None => bincode::serialize(&Option::<String>::None).expect("kv result encodes"),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.data).expect("kv state encodes")
    }

    fn restore(&mut self, snapshot: &[u8]) {
        self.data = bincode::deserialize(snapshot).unwrap_or_default();
    }
}
