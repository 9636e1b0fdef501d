//! KV service implementation
//!
//! Serves client [`KvRequest`] frames against the coordinator.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::kv_server::KvServer;
use crate::metrics;
use crate::raft::Consensus;
use crate::rpc::{self, KvRequest, KvResponse};

pub async fn serve<C: Consensus>(listener: TcpListener, server: Arc<KvServer<C>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("client connection from {}", peer);
                tokio::spawn(handle_connection(stream, server.clone()));
            }
            Err(e) => log::warn!("kv accept error: {}", e),
        }
    }
}

/// Requests on one connection are answered in order.
async fn handle_connection<C: Consensus>(stream: TcpStream, server: Arc<KvServer<C>>) {
    let mut stream = rpc::framed(stream);
    loop {
        let request = match rpc::next_message::<_, KvRequest>(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                log::warn!("kv read error: {}", e);
                return;
            }
        };
        let response = dispatch(&server, request).await;
        if let Err(e) = rpc::send_message(&mut stream, &response).await {
            log::warn!("kv write error: {}", e);
            return;
        }
    }
}

async fn dispatch<C: Consensus>(server: &Arc<KvServer<C>>, request: KvRequest) -> KvResponse {
    let method = request.method();
    metrics::record_metrics(method, || async move {
        match request {
            KvRequest::Get(args) => KvResponse::Get(server.get(args).await),
            KvRequest::PutAppend(args) => KvResponse::PutAppend(server.put_append(args).await),
        }
    })
    .await
}
