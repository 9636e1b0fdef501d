//! A replicated, linearizable key/value service on top of raft.
//!
//! Clients talk to a [`clerk::Clerk`], which finds the current leader among
//! the replicas. Each replica runs a [`kv_server::KvServer`] that pushes
//! operations through the replicated log and applies them once committed.

pub mod clerk;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv_server;
pub mod kv_service;
pub mod metrics;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod rpc;
pub mod server;

pub use error::{Error, Result};
