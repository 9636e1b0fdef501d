//! Error types shared across the crate.
//!
//! Per-request outcomes (wrong leader, timeout) are not errors; they travel in
//! [`crate::rpc::ReplyStatus`]. This type covers the failures that stop an
//! operation outright.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),

    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A log operation referenced indices outside the live window.
    #[error("log range [{from}, {to}) is not live (live window [{base}, {next}))")]
    LogRange {
        from: u64,
        to: u64,
        base: u64,
        next: u64,
    },

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
