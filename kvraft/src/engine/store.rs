//! The replicated state machine: a string map plus per-clerk progress.

use std::collections::BTreeMap;

use crate::engine::op::{Op, OpKind};
use crate::engine::snapshot::KvSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    dedup: BTreeMap<u64, u64>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }

    pub fn get(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }

    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    pub fn append(&mut self, key: String, value: &str) {
        self.data.entry(key).or_default().push_str(value);
    }

    /// True when `op_id` is below the next op id expected from `clerk_id`.
    pub fn is_applied(&self, clerk_id: u64, op_id: u64) -> bool {
        self.dedup
            .get(&clerk_id)
            .map_or(false, |&next| op_id < next)
    }

    /// Applies `op` at most once per `(clerk_id, op_id)` and returns the value
    /// a `Get` observes. A repeated `Get` reads the current state.
    pub fn apply(&mut self, op: &Op) -> String {
        if self.is_applied(op.clerk_id, op.op_id) {
            log::debug!(
                "duplicate op {} from clerk {}, skipping",
                op.op_id,
                op.clerk_id
            );
            return match op.kind {
                OpKind::Get => self.get(&op.key),
                OpKind::Put | OpKind::Append => String::new(),
            };
        }

        let value = match op.kind {
            OpKind::Get => self.get(&op.key),
            OpKind::Put => {
                self.put(op.key.clone(), op.value.clone().unwrap_or_default());
                String::new()
            }
            OpKind::Append => {
                self.append(op.key.clone(), op.value.as_deref().unwrap_or_default());
                String::new()
            }
        };
        self.dedup.insert(op.clerk_id, op.op_id + 1);
        value
    }

    pub fn next_op_id(&self, clerk_id: u64) -> u64 {
        self.dedup.get(&clerk_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn snapshot(&self, last_index: u64, last_term: u64) -> KvSnapshot {
        KvSnapshot {
            last_index,
            last_term,
            state: self.data.clone(),
            dedup: self.dedup.clone(),
        }
    }

    /// Replaces the whole state with the image in `snapshot`.
    pub fn restore(&mut self, snapshot: KvSnapshot) {
        self.data = snapshot.state;
        self.dedup = snapshot.dedup;
    }
}
