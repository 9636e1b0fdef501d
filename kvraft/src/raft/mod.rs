//! Consensus layer: raft-rs driven by one tokio task per node, a snapshot
//! aware log, and the persister both blobs are written through.

use std::future::Future;

use raft::StateRole;

pub mod log;
pub mod network;
pub mod node;
pub mod persister;
mod proposal;
pub mod storage;

pub use self::node::{Node, NodeOptions, NodeParts, RaftHandle};
pub use self::persister::{FilePersister, MemPersister, Persister};

/// Delivered on the apply stream in strict index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed client command.
    Command { index: u64, term: u64, data: Vec<u8> },
    /// A state-machine image that supersedes everything up to `index`.
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

/// Answer to [`Consensus::submit`]. `index` and `term` are only meaningful
/// when `is_leader` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Submission {
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}

impl Submission {
    pub fn not_leader(term: u64) -> Self {
        Submission {
            index: 0,
            term,
            is_leader: false,
        }
    }
}

/// A state-machine image taken right after applying `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub role: StateRole,
    pub leader_id: u64,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }
}

/// What the KV coordinator needs from the replicated log.
pub trait Consensus: Send + Sync + 'static {
    /// Appends `command` if this replica leads, without waiting for commit.
    fn submit(&self, command: Vec<u8>) -> impl Future<Output = Submission> + Send;

    /// Persists the image and compacts the log prefix it covers.
    fn install_snapshot(&self, request: SnapshotRequest);

    /// Size of the persisted raft state, in bytes.
    fn raft_state_size(&self) -> usize;

    fn shutdown(&self);
}
