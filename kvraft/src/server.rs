use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::kv_server::{KvOptions, KvServer};
use crate::raft::{FilePersister, Node, NodeOptions, RaftHandle};
use crate::raft_client::RaftClient;
use crate::{kv_service, metrics, raft_service};

/// One replica process: raft node, KV coordinator, both listeners and the
/// metrics endpoint.
pub struct Server {
    kv: Arc<KvServer<RaftHandle>>,
    kv_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn start(config: &RuntimeConfig) -> Result<Server> {
        config.validate()?;
        let persister = Arc::new(FilePersister::open(&config.data_dir)?);

        let mut options = NodeOptions::new(config.id, config.peers());
        options.tick_interval = config.tick_interval();
        options.election_tick = config.election_tick;
        options.heartbeat_tick = config.heartbeat_tick;
        options.verbose = config.raft_verbose;
        let parts = Node::start(options, persister)?;
        let mailbox = parts.handle.mailbox();

        let kv = KvServer::start(
            config.id,
            parts.handle,
            parts.apply_rx,
            KvOptions {
                max_raft_state: config.max_raft_state,
                op_timeout: config.op_timeout(),
            },
        );

        let mut tasks = Vec::new();

        let raft_listener = TcpListener::bind(&config.raft_addr).await?;
        tasks.push(tokio::spawn(raft_service::serve(raft_listener, mailbox)));
        log::info!("raft service started on {}", config.raft_addr);

        let addrs: HashMap<u64, String> = config
            .node_list
            .iter()
            .filter(|n| n.id != config.id)
            .map(|n| (n.id, n.raft_addr.clone()))
            .collect();
        tasks.push(tokio::spawn(RaftClient::new(addrs).run(parts.outbound)));

        let kv_listener = TcpListener::bind(&config.addr).await?;
        let kv_addr = kv_listener.local_addr()?;
        tasks.push(tokio::spawn(kv_service::serve(kv_listener, kv.clone())));
        log::info!("kv service started on {}", kv_addr);

        tasks.push(Self::start_metrics_server(&config.metrics_addr)?);

        Ok(Server { kv, kv_addr, tasks })
    }

    pub fn kv(&self) -> &Arc<KvServer<RaftHandle>> {
        &self.kv
    }

    /// Bound client address, useful when `addr` asked for port 0.
    pub fn kv_addr(&self) -> SocketAddr {
        self.kv_addr
    }

    pub fn stop(&mut self) {
        log::info!("server {} stop", self.kv.me());
        self.kv.kill();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn start_metrics_server(addr: &str) -> Result<JoinHandle<()>> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("metrics_addr {}: {}", addr, e)))?;
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| async move {
                Ok::<_, hyper::Error>(Response::new(Body::from(metrics::encode_registry())))
            }))
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .map_err(|e| Error::InvalidConfig(format!("metrics_addr {}: {}", addr, e)))?
            .serve(make_svc);
        log::info!("metrics server started on {}", addr);
        Ok(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server error: {}", e);
            }
        }))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.kv.is_killed() {
            self.stop();
        }
    }
}
