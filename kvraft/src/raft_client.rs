//! Raft client implementation
//!
//! Ships outbound raft messages to peers over one persistent TCP connection
//! per peer, each message protobuf-encoded in a length-prefixed frame.

use bytes::Bytes;
use futures::SinkExt;
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Duration, Instant};
use tokio_util::codec::FramedWrite;

use crate::rpc;

const PEER_CHANNEL_SIZE: usize = 1000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

/// Client for a single peer node
struct PeerClient {
    /// Channel sender for sending encoded messages to the peer
    sender: Sender<Vec<u8>>,
    /// Flag indicating if the client is invalid/needs reconnection
    invalid: Arc<AtomicBool>,
    created: Instant,
}

impl PeerClient {
    /// Spawns the connection task. Messages queue up while it connects.
    fn new(id: u64, addr: String) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_SIZE);
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&addr, receiver).await {
                log::warn!("Streaming raft messages to peer {} at {} failed: {}", id, addr, e);
            }
            invalid_clone.store(true, Ordering::SeqCst);
        });

        Self {
            sender,
            invalid,
            created: Instant::now(),
        }
    }

    async fn stream_messages(addr: &str, mut receiver: Receiver<Vec<u8>>) -> crate::Result<()> {
        let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;
        let mut frames = FramedWrite::new(stream, rpc::frame_codec());
        while let Some(data) = receiver.recv().await {
            frames.send(Bytes::from(data)).await?;
        }
        Ok(())
    }
}

/// Client for managing connections to all peer nodes
pub struct RaftClient {
    addrs: HashMap<u64, String>,
    peers: HashMap<u64, PeerClient>,
}

impl RaftClient {
    /// `addrs` maps peer ids to their raft endpoints.
    pub fn new(addrs: HashMap<u64, String>) -> RaftClient {
        RaftClient {
            addrs,
            peers: HashMap::new(),
        }
    }

    /// Forwards everything the node emits until its outbound mailbox closes.
    pub async fn run(mut self, mut outbound: Receiver<RaftMessage>) {
        while let Some(msg) = outbound.recv().await {
            self.post_data(msg);
        }
    }

    /// Sends a raft message to its peer. Raft retransmits on its own, so
    /// messages for an unreachable peer are dropped.
    pub fn post_data(&mut self, msg: RaftMessage) {
        let to = msg.to;
        if let Some(client) = self.peers.get(&to) {
            if client.invalid.load(Ordering::SeqCst) {
                if client.created.elapsed() < RECONNECT_INTERVAL {
                    return;
                }
                self.peers.remove(&to);
            }
        }

        if !self.peers.contains_key(&to) {
            let addr = match self.addrs.get(&to) {
                Some(addr) => addr.clone(),
                None => {
                    log::warn!("no address for peer {}, dropping message", to);
                    return;
                }
            };
            self.peers.insert(to, PeerClient::new(to, addr));
        }

        let data = match msg.write_to_bytes() {
            Ok(data) => data,
            Err(e) => {
                log::error!("Failed to encode raft message: {}", e);
                return;
            }
        };
        if let Some(client) = self.peers.get(&to) {
            if client.sender.try_send(data).is_err() {
                log::debug!("raft channel to peer {} is full, dropping message", to);
            }
        }
    }
}
