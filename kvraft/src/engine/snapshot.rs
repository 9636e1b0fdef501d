use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Frozen state-machine image at `last_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KvSnapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub state: BTreeMap<String, String>,
    /// clerk id -> next expected op id
    pub dedup: BTreeMap<u64, u64>,
}

impl KvSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
