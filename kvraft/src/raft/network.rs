//! In-process message routing between nodes of one cluster.
//!
//! Disconnecting a node drops everything it sends and everything sent to it,
//! which is how tests model partitions and crashed peers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use raft::prelude::Message;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Routes {
    mailboxes: HashMap<u64, Sender<Message>>,
    connected: HashSet<u64>,
}

#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Registers node `id` (replacing an earlier incarnation) and forwards its
    /// outbound messages until the node stops.
    pub fn register(
        &self,
        id: u64,
        mailbox: Sender<Message>,
        mut outbound: Receiver<Message>,
    ) -> JoinHandle<()> {
        {
            let mut routes = self.routes.lock().unwrap();
            routes.mailboxes.insert(id, mailbox);
            routes.connected.insert(id);
        }

        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let target = {
                    let routes = routes.lock().unwrap();
                    if routes.connected.contains(&msg.from) && routes.connected.contains(&msg.to) {
                        routes.mailboxes.get(&msg.to).cloned()
                    } else {
                        None
                    }
                };
                if let Some(mailbox) = target {
                    if mailbox.try_send(msg).is_err() {
                        log::debug!("mailbox of node {} is full or closed", id);
                    }
                }
            }
        })
    }

    pub fn connect(&self, id: u64) {
        self.routes.lock().unwrap().connected.insert(id);
    }

    pub fn disconnect(&self, id: u64) {
        self.routes.lock().unwrap().connected.remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        self.routes.lock().unwrap().connected.contains(&id)
    }
}
