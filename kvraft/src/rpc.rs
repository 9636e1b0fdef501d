//! Client-facing request/reply types and the length-prefixed TCP framing
//! shared by the KV and raft listeners.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::engine::{Op, OpKind};
use crate::error::{Error, Result};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Outcome of one client RPC. A missing key is `Ok` with an empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    /// This server does not lead; try another.
    WrongLeader,
    /// Nothing matching committed in time; retry, possibly here.
    Timeout,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::WrongLeader => "wrong_leader",
            ReplyStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub clerk_id: u64,
    pub op_id: u64,
}

impl From<GetArgs> for Op {
    fn from(args: GetArgs) -> Op {
        Op::get(args.clerk_id, args.op_id, args.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub status: ReplyStatus,
    pub value: String,
}

impl GetReply {
    pub fn with_status(status: ReplyStatus) -> Self {
        GetReply {
            status,
            value: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub clerk_id: u64,
    pub op_id: u64,
}

impl From<PutAppendArgs> for Op {
    fn from(args: PutAppendArgs) -> Op {
        let kind = match args.op {
            PutAppendOp::Put => OpKind::Put,
            PutAppendOp::Append => OpKind::Append,
        };
        Op {
            clerk_id: args.clerk_id,
            op_id: args.op_id,
            kind,
            key: args.key,
            value: Some(args.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvRequest {
    Get(GetArgs),
    PutAppend(PutAppendArgs),
}

impl KvRequest {
    pub fn method(&self) -> &'static str {
        match self {
            KvRequest::Get(_) => "get",
            KvRequest::PutAppend(args) => match args.op {
                PutAppendOp::Put => "put",
                PutAppendOp::Append => "append",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Get(GetReply),
    PutAppend(PutAppendReply),
}

impl KvResponse {
    pub fn status(&self) -> ReplyStatus {
        match self {
            KvResponse::Get(reply) => reply.status,
            KvResponse::PutAppend(reply) => reply.status,
        }
    }
}

/// Length-delimited codec shared by the KV and raft connections.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A connection carrying length-delimited frames.
pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S>(stream: S) -> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, frame_codec())
}

pub async fn send_message<S, T>(framed: &mut FramedStream<S>, message: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Reads the next message. `None` means the peer closed the stream between
/// frames.
pub async fn next_message<S, T>(framed: &mut FramedStream<S>) -> Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match framed.next().await {
        Some(frame) => Ok(Some(bincode::deserialize(&frame?)?)),
        None => Ok(None),
    }
}
