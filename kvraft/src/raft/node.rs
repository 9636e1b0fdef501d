//! Raft node implementation
//! One tokio task owns the `RawNode`; everything else talks to it through
//! channels held by a cloneable [`RaftHandle`].

#![allow(clippy::field_reassign_with_default)]

use std::sync::Arc;

use raft::{prelude::*, StateRole, Storage};
use slog::{o, Drain};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::error::Result;
use crate::raft::persister::Persister;
use crate::raft::proposal::Proposal;
use crate::raft::storage::LogStorage;
use crate::raft::{ApplyMsg, Consensus, RaftStatus, SnapshotRequest, Submission};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const MAILBOX_SIZE: usize = 1000;
const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;
const MAX_INFLIGHT_MSGS: usize = 256;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub id: u64,
    /// Every voter of the group, including `id`.
    pub peers: Vec<u64>,
    pub tick_interval: Duration,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    /// Route raft-rs internal logging to the terminal.
    pub verbose: bool,
}

impl NodeOptions {
    pub fn new(id: u64, peers: Vec<u64>) -> Self {
        NodeOptions {
            id,
            peers,
            tick_interval: DEFAULT_TICK_INTERVAL,
            election_tick: 10,
            heartbeat_tick: 3,
            verbose: false,
        }
    }

    fn raft_config(&self, applied: u64) -> Config {
        Config {
            id: self.id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            applied,
            max_size_per_msg: MAX_SIZE_PER_MSG,
            max_inflight_msgs: MAX_INFLIGHT_MSGS,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        }
    }
}

enum Control {
    Snapshot(SnapshotRequest),
    Campaign,
    Shutdown,
}

/// What [`Node::start`] hands back: the handle, the outbound raft messages
/// for the transport, and the apply stream.
pub struct NodeParts {
    pub handle: RaftHandle,
    pub outbound: Receiver<Message>,
    pub apply_rx: UnboundedReceiver<ApplyMsg>,
}

/// Cloneable front end of a running node.
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    mailbox: Sender<Message>,
    proposals: UnboundedSender<Proposal>,
    controls: UnboundedSender<Control>,
    status: watch::Receiver<RaftStatus>,
    persister: Arc<dyn Persister>,
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inbound raft messages from peers go here.
    pub fn mailbox(&self) -> Sender<Message> {
        self.mailbox.clone()
    }

    pub fn status(&self) -> RaftStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Starts an election on this node right away.
    pub fn campaign(&self) {
        let _ = self.controls.send(Control::Campaign);
    }
}

impl Consensus for RaftHandle {
    async fn submit(&self, command: Vec<u8>) -> Submission {
        let (proposal, rx) = Proposal::normal(command);
        if self.proposals.send(proposal).is_err() {
            return Submission::not_leader(self.status().term);
        }
        match rx.await {
            Ok(submission) => submission,
            Err(_) => Submission::not_leader(self.status().term),
        }
    }

    fn install_snapshot(&self, request: SnapshotRequest) {
        if self.controls.send(Control::Snapshot(request)).is_err() {
            log::warn!("raft node {} stopped, snapshot dropped", self.id);
        }
    }

    fn raft_state_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    fn shutdown(&self) {
        let _ = self.controls.send(Control::Shutdown);
    }
}

pub struct Node {
    raft_group: RawNode<LogStorage>,
    my_mailbox: Receiver<Message>,
    out_mailbox: Sender<Message>,
    proposals: UnboundedReceiver<Proposal>,
    controls: UnboundedReceiver<Control>,
    apply_tx: UnboundedSender<ApplyMsg>,
    status_tx: watch::Sender<RaftStatus>,
    tick_interval: Duration,
    // Last index delivered on the apply stream, entries and snapshots alike.
    applied: u64,
}

impl Node {
    /// Restores from `persister` and spawns the node task. When a snapshot was
    /// persisted it is the first message on the apply stream, followed by the
    /// committed entries after it.
    pub fn start(options: NodeOptions, persister: Arc<dyn Persister>) -> Result<NodeParts> {
        let logger = raft_logger(options.id, options.verbose);
        let storage = LogStorage::new(persister.clone(), &options.peers)?;

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let snapshot = storage.latest_snapshot();
        let applied = storage.snapshot_index();
        if applied > 0 {
            let metadata = snapshot.get_metadata();
            log::info!(
                "raft node {} restoring snapshot at index {} term {}",
                options.id,
                metadata.index,
                metadata.term
            );
            let _ = apply_tx.send(ApplyMsg::Snapshot {
                index: metadata.index,
                term: metadata.term,
                data: snapshot.get_data().to_vec(),
            });
        }

        let cfg = options.raft_config(applied);
        let raft_group = RawNode::new(&cfg, storage, &logger)?;

        let (mailbox, my_mailbox) = mpsc::channel(MAILBOX_SIZE);
        let (out_mailbox, outbound) = mpsc::channel(MAILBOX_SIZE);
        let (proposals_tx, proposals) = mpsc::unbounded_channel();
        let (controls_tx, controls) = mpsc::unbounded_channel();
        let initial = RaftStatus {
            id: options.id,
            term: raft_group.raft.term,
            role: raft_group.raft.state,
            leader_id: raft_group.raft.leader_id,
        };
        let (status_tx, status) = watch::channel(initial);

        let node = Node {
            raft_group,
            my_mailbox,
            out_mailbox,
            proposals,
            controls,
            apply_tx,
            status_tx,
            tick_interval: options.tick_interval,
            applied,
        };
        tokio::spawn(node.run());

        let handle = RaftHandle {
            id: options.id,
            mailbox,
            proposals: proposals_tx,
            controls: controls_tx,
            status,
            persister,
        };
        Ok(NodeParts {
            handle,
            outbound,
            apply_rx,
        })
    }

    fn id(&self) -> u64 {
        self.raft_group.raft.id
    }

    async fn run(mut self) {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    self.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        self.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                control = self.controls.recv() => {
                    match control {
                        Some(Control::Snapshot(request)) => {
                            if let Err(e) = self.compact(request) {
                                log::error!("raft node {} failed to save snapshot: {}", self.id(), e);
                                break;
                            }
                        }
                        Some(Control::Campaign) => {
                            if let Err(e) = self.raft_group.campaign() {
                                log::warn!("raft node {} campaign failed: {}", self.id(), e);
                            }
                        }
                        Some(Control::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
            }

            if let Err(e) = self.on_ready() {
                log::error!("raft node {} failed to handle ready: {}", self.id(), e);
                break;
            }
            self.publish_status();
        }
        log::info!("raft node {} stopped", self.id());
    }

    fn step(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::debug!("raft node {} dropped message: {}", self.id(), e);
        }
    }

    /// Appends a proposal if this node leads. The reply carries the index the
    /// entry was given, or `is_leader = false` when nothing was appended.
    fn propose(&mut self, proposal: Proposal) {
        let raft = &self.raft_group.raft;
        let term = raft.term;
        if raft.state != StateRole::Leader {
            proposal.reply(Submission::not_leader(term));
            return;
        }

        let index = raft.raft_log.last_index() + 1;
        let appended = self.raft_group.propose(vec![], proposal.data.clone()).is_ok()
            && self.raft_group.raft.raft_log.last_index() == index;
        if appended {
            proposal.reply(Submission {
                index,
                term,
                is_leader: true,
            });
        } else {
            proposal.reply(Submission::not_leader(term));
        }
    }

    /// Saves a state-machine image and drops the log prefix it covers.
    fn compact(&mut self, request: SnapshotRequest) -> Result<()> {
        let id = self.id();
        let applied = self.applied;
        let store = self.raft_group.mut_store();
        if request.index <= store.snapshot_index() || request.index > applied {
            log::debug!(
                "raft node {} ignoring snapshot at {} (snapshot {}, applied {})",
                id,
                request.index,
                store.snapshot_index(),
                applied
            );
            return Ok(());
        }
        match store.term(request.index) {
            Ok(term) if term == request.term => {}
            other => {
                log::warn!(
                    "raft node {} snapshot term {} at {} does not match log term {:?}",
                    id,
                    request.term,
                    request.index,
                    other
                );
                return Ok(());
            }
        }
        if store.compact_with_snapshot(request.index, request.data)? {
            log::info!(
                "raft node {} saved snapshot at index {}, log starts at {}",
                id,
                request.index,
                store.log().base()
            );
        }
        Ok(())
    }

    fn on_ready(&mut self) -> Result<()> {
        if !self.raft_group.has_ready() {
            return Ok(());
        }

        let mut ready = self.raft_group.ready();

        // Step 1: messages that do not wait for persistence
        if !ready.messages().is_empty() {
            self.send_messages(ready.take_messages());
        }

        // Step 2: snapshot from the leader
        if *ready.snapshot() != Snapshot::default() {
            self.install_leader_snapshot(ready.snapshot().clone())?;
        }

        // Step 3: committed entries
        self.handle_committed_entries(ready.take_committed_entries());

        // Step 4: persist entries and hard state
        {
            let store = self.raft_group.mut_store();
            store.append_entries(ready.entries())?;
            if let Some(hs) = ready.hs() {
                store.set_hardstate(hs.clone());
            }
            store.persist()?;
        }
        if !ready.persisted_messages().is_empty() {
            self.send_messages(ready.take_persisted_messages());
        }

        // Step 5: advance
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            let store = self.raft_group.mut_store();
            store.set_commit(commit);
            store.persist()?;
        }
        self.send_messages(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries());
        self.raft_group.advance_apply();
        Ok(())
    }

    fn install_leader_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term) = {
            let metadata = snapshot.get_metadata();
            (metadata.index, metadata.term)
        };
        self.raft_group.mut_store().apply_snapshot(&snapshot)?;
        self.applied = index;
        log::info!(
            "raft node {} installed snapshot at index {} term {}",
            self.id(),
            index,
            term
        );
        self.deliver(ApplyMsg::Snapshot {
            index,
            term,
            data: snapshot.get_data().to_vec(),
        });
        Ok(())
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.index <= self.applied {
                continue;
            }
            self.applied = entry.index;
            // leader no-op
            if entry.data.is_empty() {
                continue;
            }
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.deliver(ApplyMsg::Command {
                    index: entry.index,
                    term: entry.term,
                    data: entry.data.to_vec(),
                }),
                other => {
                    log::warn!(
                        "raft node {} skipping {:?} entry at {}",
                        self.id(),
                        other,
                        entry.index
                    );
                }
            }
        }
    }

    fn deliver(&self, msg: ApplyMsg) {
        if self.apply_tx.send(msg).is_err() {
            log::debug!("raft node {} apply stream closed", self.id());
        }
    }

    fn send_messages(&self, messages: Vec<Message>) {
        for msg in messages {
            if let Err(e) = self.out_mailbox.try_send(msg) {
                log::warn!("Failed to send raft message {:?}, Raft will retry", e);
            }
        }
    }

    fn publish_status(&mut self) {
        let raft = &self.raft_group.raft;
        let status = RaftStatus {
            id: raft.id,
            term: raft.term,
            role: raft.state,
            leader_id: raft.leader_id,
        };
        let previous = *self.status_tx.borrow();
        if previous == status {
            return;
        }
        if previous.role != status.role {
            log::info!(
                "raft node {} role changed {:?} -> {:?} (term {}, leader {})",
                status.id,
                previous.role,
                status.role,
                status.term,
                status.leader_id
            );
        }
        self.status_tx.send_replace(status);
    }
}

fn raft_logger(id: u64, verbose: bool) -> slog::Logger {
    let root = if verbose {
        terminal_logger()
    } else {
        slog::Logger::root(slog::Discard, o!())
    };
    root.new(o!("tag" => format!("peer_{}", id)))
}

#[cfg(feature = "slog-term")]
fn terminal_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!())
}

#[cfg(not(feature = "slog-term"))]
fn terminal_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}
