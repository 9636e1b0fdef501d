use std::collections::HashSet;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use tokio::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: u64,
    /// Client-facing KV endpoint.
    pub addr: String,
    /// Peer-facing raft endpoint.
    pub raft_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub id: u64,
    pub addr: String,
    pub raft_addr: String,
    pub metrics_addr: String,
    pub data_dir: String,
    /// -1 disables snapshots.
    pub max_raft_state: i64,
    pub op_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub raft_verbose: bool,
    pub node_list: Vec<NodeConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    /// A single-node cluster on local ports.
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4000".to_string(),
            raft_addr: "0.0.0.0:4001".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: "data".to_string(),
            max_raft_state: -1,
            op_timeout_ms: 2000,
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 3,
            raft_verbose: false,
            node_list: vec![NodeConfig {
                id: 1,
                addr: "127.0.0.1:4000".to_string(),
                raft_addr: "127.0.0.1:4001".to_string(),
            }],
        }
    }

    /// Loads and validates `path`. A missing file falls back to the defaults.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = match std::fs::read_to_string(path.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file {:?}, using defaults: {:?}",
                    path.as_ref(),
                    e
                );
                return Ok(RuntimeConfig::new());
            }
        };
        RuntimeConfig::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.node_list {
            if !ids.insert(node.id) {
                return Err(Error::InvalidConfig(format!(
                    "node {} listed twice",
                    node.id
                )));
            }
        }
        if !ids.contains(&self.id) {
            return Err(Error::InvalidConfig(format!(
                "node {} is not in node_list",
                self.id
            )));
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::InvalidConfig(
                "election_tick must be greater than heartbeat_tick".to_string(),
            ));
        }
        Ok(())
    }

    pub fn peers(&self) -> Vec<u64> {
        self.node_list.iter().map(|n| n.id).collect()
    }

    pub fn node(&self, id: u64) -> Option<&NodeConfig> {
        self.node_list.iter().find(|n| n.id == id)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
