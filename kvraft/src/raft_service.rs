use futures::StreamExt;
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio_util::codec::FramedRead;

use crate::rpc;

/// Accepts peer connections and feeds every decoded raft message into the
/// local node's mailbox.
pub async fn serve(listener: TcpListener, mailbox: Sender<RaftMessage>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("raft connection from {}", peer);
                tokio::spawn(post_data(stream, mailbox.clone()));
            }
            Err(e) => log::warn!("raft accept error: {}", e),
        }
    }
}

async fn post_data(stream: TcpStream, mailbox: Sender<RaftMessage>) {
    let mut frames = FramedRead::new(stream, rpc::frame_codec());
    loop {
        let data = match frames.next().await {
            Some(Ok(data)) => data,
            None => return,
            Some(Err(e)) => {
                log::warn!("raft read error: {}", e);
                return;
            }
        };
        match RaftMessage::parse_from_bytes(&data) {
            Ok(message) => {
                if mailbox.send(message).await.is_err() {
                    log::warn!("raft node stopped, closing peer connection");
                    return;
                }
            }
            Err(e) => {
                log::warn!("raft parse error: {}", e);
            }
        }
    }
}
