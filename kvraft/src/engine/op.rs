use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OpKind {
    #[default]
    Get,
    Put,
    Append,
}

/// A client command as it appears in the log. `(clerk_id, op_id)` names one
/// client attempt across all of its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Op {
    pub clerk_id: u64,
    pub op_id: u64,
    pub kind: OpKind,
    pub key: String,
    pub value: Option<String>,
}

impl Op {
    pub fn get(clerk_id: u64, op_id: u64, key: String) -> Self {
        Op {
            clerk_id,
            op_id,
            kind: OpKind::Get,
            key,
            value: None,
        }
    }

    pub fn put(clerk_id: u64, op_id: u64, key: String, value: String) -> Self {
        Op {
            clerk_id,
            op_id,
            kind: OpKind::Put,
            key,
            value: Some(value),
        }
    }

    pub fn append(clerk_id: u64, op_id: u64, key: String, value: String) -> Self {
        Op {
            clerk_id,
            op_id,
            kind: OpKind::Append,
            key,
            value: Some(value),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
