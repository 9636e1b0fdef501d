//! KV Engine Module
//!
//! - `op`: the command descriptor carried in log entries
//! - `store`: the in-memory state machine with per-clerk dedup
//! - `snapshot`: the frozen image handed to the log for compaction

pub mod op;
pub mod snapshot;
pub mod store;

pub use self::op::{Op, OpKind};
pub use self::snapshot::KvSnapshot;
pub use self::store::KvStore;
