#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use kvraft::clerk::{Clerk, KvService};
use kvraft::engine::KvSnapshot;
use kvraft::kv_server::{KvOptions, KvServer};
use kvraft::raft::network::LocalNetwork;
use kvraft::raft::{MemPersister, Node, NodeOptions, Persister, RaftHandle};
use kvraft::rpc::{GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use kvraft::{Error, Result};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

pub const TICK: Duration = Duration::from_millis(10);
pub const OP_TIMEOUT: Duration = Duration::from_millis(800);
pub const WAIT: Duration = Duration::from_secs(10);

type ServerSlot = Arc<Mutex<Option<Arc<KvServer<RaftHandle>>>>>;

/// Server `i` as a clerk sees it: unreachable while crashed or disconnected.
pub struct Endpoint {
    id: u64,
    slot: ServerSlot,
    net: LocalNetwork,
}

impl Endpoint {
    fn current(&self) -> Result<Arc<KvServer<RaftHandle>>> {
        if !self.net.is_connected(self.id) {
            return Err(unreachable_server());
        }
        self.slot.lock().unwrap().clone().ok_or_else(unreachable_server)
    }
}

fn unreachable_server() -> Error {
    Error::Io(std::io::ErrorKind::NotConnected.into())
}

impl KvService for Endpoint {
    async fn get(&self, args: GetArgs) -> Result<GetReply> {
        let server = self.current()?;
        Ok(KvServer::get(&server, args).await)
    }

    async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply> {
        let server = self.current()?;
        Ok(KvServer::put_append(&server, args).await)
    }
}

/// A cluster of `n` replicas with ids `1..=n`, wired through a
/// [`LocalNetwork`]. Server `i` has id `i + 1`.
pub struct Cluster {
    n: usize,
    net: LocalNetwork,
    persisters: Vec<Arc<MemPersister>>,
    slots: Vec<ServerSlot>,
    forwarders: Vec<Option<JoinHandle<()>>>,
    max_raft_state: i64,
}

impl Cluster {
    pub fn new(n: usize, max_raft_state: i64) -> Cluster {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut cluster = Cluster {
            n,
            net: LocalNetwork::new(),
            persisters: (0..n).map(|_| Arc::new(MemPersister::new())).collect(),
            slots: (0..n).map(|_| Arc::new(Mutex::new(None))).collect(),
            forwarders: (0..n).map(|_| None).collect(),
            max_raft_state,
        };
        for i in 0..n {
            cluster.start_server(i);
        }
        cluster
    }

    pub fn len(&self) -> usize {
        self.n
    }

    fn id(i: usize) -> u64 {
        i as u64 + 1
    }

    /// Boots server `i` from whatever its persister holds.
    pub fn start_server(&mut self, i: usize) {
        let peers = (0..self.n).map(Self::id).collect();
        let mut options = NodeOptions::new(Self::id(i), peers);
        options.tick_interval = TICK;
        let persister: Arc<dyn Persister> = self.persisters[i].clone();
        let parts = Node::start(options, persister).unwrap();

        let forwarder = self
            .net
            .register(Self::id(i), parts.handle.mailbox(), parts.outbound);
        self.forwarders[i] = Some(forwarder);

        let server = KvServer::start(
            Self::id(i),
            parts.handle,
            parts.apply_rx,
            KvOptions {
                max_raft_state: self.max_raft_state,
                op_timeout: OP_TIMEOUT,
            },
        );
        *self.slots[i].lock().unwrap() = Some(server);
    }

    /// Kills server `i` and waits until its node task is gone, so nothing
    /// writes the persister behind a later restart.
    pub async fn crash(&mut self, i: usize) {
        self.net.disconnect(Self::id(i));
        let server = self.slots[i].lock().unwrap().take();
        if let Some(server) = server {
            server.kill();
        }
        if let Some(forwarder) = self.forwarders[i].take() {
            time::timeout(WAIT, forwarder)
                .await
                .expect("node task did not stop")
                .unwrap();
        }
    }

    pub async fn restart(&mut self, i: usize) {
        self.crash(i).await;
        self.start_server(i);
    }

    pub fn disconnect(&self, i: usize) {
        self.net.disconnect(Self::id(i));
    }

    pub fn connect(&self, i: usize) {
        self.net.connect(Self::id(i));
    }

    pub fn server(&self, i: usize) -> Arc<KvServer<RaftHandle>> {
        self.slots[i].lock().unwrap().clone().expect("server is down")
    }

    pub fn persister(&self, i: usize) -> &Arc<MemPersister> {
        &self.persisters[i]
    }

    pub fn clerk(&self) -> Clerk<Endpoint> {
        let endpoints = (0..self.n)
            .map(|i| Endpoint {
                id: Self::id(i),
                slot: self.slots[i].clone(),
                net: self.net.clone(),
            })
            .collect();
        Clerk::new(endpoints).with_backoff(Duration::from_millis(20))
    }

    /// A connected server that believes it leads.
    pub fn leader(&self) -> Option<usize> {
        (0..self.n).find(|&i| {
            self.net.is_connected(Self::id(i))
                && self.slots[i]
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|s| s.consensus().status().is_leader())
                    .unwrap_or(false)
        })
    }

    pub async fn wait_leader(&self) -> usize {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(i) = self.leader() {
                return i;
            }
            assert!(Instant::now() < deadline, "no leader elected");
            time::sleep(TICK * 5).await;
        }
    }

    pub async fn applied_state(&self, i: usize) -> KvSnapshot {
        self.server(i).applied_state().await.expect("apply task stopped")
    }

    /// Polls server `i` until its applied state satisfies `done`.
    pub async fn wait_applied<F>(&self, i: usize, done: F) -> KvSnapshot
    where
        F: Fn(&KvSnapshot) -> bool,
    {
        let deadline = Instant::now() + WAIT;
        loop {
            let state = self.applied_state(i).await;
            if done(&state) {
                return state;
            }
            assert!(
                Instant::now() < deadline,
                "server {} never converged, last applied {}",
                i,
                state.last_index
            );
            time::sleep(TICK * 5).await;
        }
    }

    pub async fn shutdown(mut self) {
        for i in 0..self.n {
            self.crash(i).await;
        }
    }
}
