//! KV coordinator: submits client ops to consensus, parks each caller on a
//! per-index rendezvous and releases it from the apply task once the same
//! entry commits under the same term.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::engine::{KvSnapshot, KvStore, Op};
use crate::raft::{ApplyMsg, Consensus, SnapshotRequest};
use crate::rpc::{GetArgs, GetReply, PutAppendArgs, PutAppendReply, ReplyStatus};

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct KvOptions {
    /// Snapshot once the persisted raft state grows past this many bytes.
    /// Negative or zero disables snapshots.
    pub max_raft_state: i64,
    pub op_timeout: Duration,
}

impl Default for KvOptions {
    fn default() -> Self {
        KvOptions {
            max_raft_state: -1,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

struct Waiter {
    tx: oneshot::Sender<String>,
    term: u64,
    id: u64,
}

/// Rendezvous table keyed by log index.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, Waiter>,
    /// Waiters displaced by a later submission at their index, keyed by id.
    /// They are never completed; each leaves when its own caller times out.
    superseded: HashMap<u64, Waiter>,
    next_id: u64,
}

impl Pending {
    /// Parks a caller at `index`. A waiter already parked there moves to
    /// `superseded` and keeps waiting out its own timeout.
    fn register(&mut self, index: u64, term: u64, tx: oneshot::Sender<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(old) = self.waiters.insert(index, Waiter { tx, term, id }) {
            log::debug!(
                "waiter at index {} from term {} superseded by term {}",
                index,
                old.term,
                term
            );
            self.superseded.insert(old.id, old);
        }
        id
    }

    fn deregister(&mut self, index: u64, id: u64) {
        if self.waiters.get(&index).map_or(false, |w| w.id == id) {
            self.waiters.remove(&index);
        } else {
            self.superseded.remove(&id);
        }
    }

    /// Hands `value` to the waiter at `index` if it submitted in `term`.
    fn complete(&mut self, index: u64, term: u64, value: String) -> bool {
        match self.waiters.get(&index) {
            Some(waiter) if waiter.term == term => {}
            Some(waiter) => {
                log::debug!(
                    "entry {} committed in term {}, waiter expected term {}",
                    index,
                    term,
                    waiter.term
                );
                return false;
            }
            None => return false,
        }
        match self.waiters.remove(&index) {
            Some(waiter) => waiter.tx.send(value).is_ok(),
            None => false,
        }
    }
}

pub struct KvServer<C: Consensus> {
    me: u64,
    consensus: Arc<C>,
    pending: Arc<Mutex<Pending>>,
    queries: UnboundedSender<oneshot::Sender<KvSnapshot>>,
    options: KvOptions,
    apply_task: JoinHandle<()>,
    killed: AtomicBool,
}

impl<C: Consensus> KvServer<C> {
    /// Spawns the apply task and returns immediately.
    pub fn start(
        me: u64,
        consensus: C,
        apply_rx: UnboundedReceiver<ApplyMsg>,
        options: KvOptions,
    ) -> Arc<Self> {
        let consensus = Arc::new(consensus);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (queries, queries_rx) = mpsc::unbounded_channel();

        let applier = Applier {
            me,
            store: KvStore::new(),
            last_applied: 0,
            last_term: 0,
            consensus: consensus.clone(),
            pending: pending.clone(),
            max_raft_state: options.max_raft_state,
        };
        let apply_task = tokio::spawn(applier.run(apply_rx, queries_rx));

        Arc::new(KvServer {
            me,
            consensus,
            pending,
            queries,
            options,
            apply_task,
            killed: AtomicBool::new(false),
        })
    }

    pub fn me(&self) -> u64 {
        self.me
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub async fn get(&self, args: GetArgs) -> GetReply {
        let (status, value) = self.execute(args.into()).await;
        GetReply { status, value }
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let (status, _) = self.execute(args.into()).await;
        PutAppendReply { status }
    }

    /// Stops consensus and the apply task. Later calls answer `WrongLeader`.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("kv server {} killed", self.me);
        self.consensus.shutdown();
        self.apply_task.abort();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Image of the applied state, read through the apply task.
    pub async fn applied_state(&self) -> Option<KvSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.queries.send(tx).ok()?;
        rx.await.ok()
    }

    async fn execute(&self, op: Op) -> (ReplyStatus, String) {
        if self.is_killed() {
            return (ReplyStatus::WrongLeader, String::new());
        }
        let command = match op.encode() {
            Ok(command) => command,
            Err(e) => {
                log::error!("kv server {} failed to encode {:?}: {}", self.me, op, e);
                return (ReplyStatus::Timeout, String::new());
            }
        };

        // Held across submit so the apply task cannot reach the index before
        // the waiter exists.
        let (index, id, rx) = {
            let mut pending = self.pending.lock().await;
            let submission = self.consensus.submit(command).await;
            if !submission.is_leader {
                return (ReplyStatus::WrongLeader, String::new());
            }
            let (tx, rx) = oneshot::channel();
            let id = pending.register(submission.index, submission.term, tx);
            (submission.index, id, rx)
        };

        let outcome = time::timeout(self.options.op_timeout, rx).await;
        self.pending.lock().await.deregister(index, id);

        match outcome {
            Ok(Ok(value)) => (ReplyStatus::Ok, value),
            Ok(Err(_)) | Err(_) => {
                log::debug!("kv server {} op {:?} at {} timed out", self.me, op, index);
                (ReplyStatus::Timeout, String::new())
            }
        }
    }
}

impl<C: Consensus> Drop for KvServer<C> {
    fn drop(&mut self) {
        self.apply_task.abort();
    }
}

/// Sole owner of the state machine.
struct Applier<C: Consensus> {
    me: u64,
    store: KvStore,
    last_applied: u64,
    last_term: u64,
    consensus: Arc<C>,
    pending: Arc<Mutex<Pending>>,
    max_raft_state: i64,
}

impl<C: Consensus> Applier<C> {
    async fn run(
        mut self,
        mut apply_rx: UnboundedReceiver<ApplyMsg>,
        mut queries: UnboundedReceiver<oneshot::Sender<KvSnapshot>>,
    ) {
        loop {
            tokio::select! {
                // queries see every message that arrived before them
                biased;
                msg = apply_rx.recv() => match msg {
                    Some(ApplyMsg::Snapshot { index, term, data }) => {
                        self.install_snapshot(index, term, &data);
                    }
                    Some(ApplyMsg::Command { index, term, data }) => {
                        self.apply_command(index, term, &data).await;
                    }
                    None => break,
                },
                Some(reply) = queries.recv() => {
                    let _ = reply.send(self.store.snapshot(self.last_applied, self.last_term));
                }
            }
        }
        log::info!("kv server {} apply stream closed", self.me);
    }

    fn install_snapshot(&mut self, index: u64, term: u64, data: &[u8]) {
        if index <= self.last_applied {
            log::warn!(
                "kv server {} ignoring snapshot at {}, already applied {}",
                self.me,
                index,
                self.last_applied
            );
            return;
        }
        let snapshot = match KvSnapshot::decode(data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!(
                    "kv server {} cannot decode snapshot at {}: {}",
                    self.me,
                    index,
                    e
                );
                std::process::abort();
            }
        };
        log::info!(
            "kv server {} installed snapshot at index {} term {} ({} keys)",
            self.me,
            index,
            term,
            snapshot.state.len()
        );
        self.store.restore(snapshot);
        self.last_applied = index;
        self.last_term = term;
    }

    async fn apply_command(&mut self, index: u64, term: u64, data: &[u8]) {
        if index <= self.last_applied {
            log::warn!(
                "kv server {} ignoring entry {}, already applied {}",
                self.me,
                index,
                self.last_applied
            );
            return;
        }
        let op = match Op::decode(data) {
            Ok(op) => op,
            Err(e) => {
                log::error!(
                    "kv server {} cannot decode entry {} term {}: {}",
                    self.me,
                    index,
                    term,
                    e
                );
                std::process::abort();
            }
        };

        let value = self.store.apply(&op);
        self.last_applied = index;
        self.last_term = term;
        log::debug!(
            "kv server {} applied {:?} {} at {} term {}",
            self.me,
            op.kind,
            op.key,
            index,
            term
        );

        self.pending.lock().await.complete(index, term, value);
        self.maybe_snapshot(index, term);
    }

    fn maybe_snapshot(&self, index: u64, term: u64) {
        if self.max_raft_state <= 0
            || self.consensus.raft_state_size() as i64 <= self.max_raft_state
        {
            return;
        }
        match self.store.snapshot(index, term).encode() {
            Ok(data) => self
                .consensus
                .install_snapshot(SnapshotRequest { index, term, data }),
            Err(e) => log::error!("kv server {} failed to encode snapshot: {}", self.me, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Submission;
    use crate::rpc::PutAppendOp;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeState {
        leader: bool,
        term: u64,
        last_index: u64,
        submitted: Vec<(u64, Vec<u8>)>,
        snapshots: Vec<SnapshotRequest>,
        raft_state_size: usize,
        shut_down: bool,
    }

    #[derive(Clone, Default)]
    struct FakeConsensus {
        state: Arc<StdMutex<FakeState>>,
    }

    impl FakeConsensus {
        fn leader(term: u64) -> Self {
            let fake = FakeConsensus::default();
            {
                let mut state = fake.state.lock().unwrap();
                state.leader = true;
                state.term = term;
            }
            fake
        }

        fn submitted(&self) -> Vec<(u64, Vec<u8>)> {
            self.state.lock().unwrap().submitted.clone()
        }

        async fn wait_submitted(&self, n: usize) -> Vec<(u64, Vec<u8>)> {
            time::timeout(Duration::from_secs(5), async {
                loop {
                    let submitted = self.submitted();
                    if submitted.len() >= n {
                        return submitted;
                    }
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap()
        }
    }

    impl Consensus for FakeConsensus {
        async fn submit(&self, command: Vec<u8>) -> Submission {
            let mut state = self.state.lock().unwrap();
            if !state.leader {
                return Submission::not_leader(state.term);
            }
            state.last_index += 1;
            let index = state.last_index;
            state.submitted.push((index, command));
            Submission {
                index,
                term: state.term,
                is_leader: true,
            }
        }

        fn install_snapshot(&self, request: SnapshotRequest) {
            self.state.lock().unwrap().snapshots.push(request);
        }

        fn raft_state_size(&self) -> usize {
            self.state.lock().unwrap().raft_state_size
        }

        fn shutdown(&self) {
            self.state.lock().unwrap().shut_down = true;
        }
    }

    fn start(
        fake: &FakeConsensus,
        options: KvOptions,
    ) -> (Arc<KvServer<FakeConsensus>>, UnboundedSender<ApplyMsg>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let server = KvServer::start(0, fake.clone(), apply_rx, options);
        (server, apply_tx)
    }

    fn short_timeout() -> KvOptions {
        KvOptions {
            op_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn put(key: &str, value: &str, op: PutAppendOp, clerk_id: u64, op_id: u64) -> PutAppendArgs {
        PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            clerk_id,
            op_id,
        }
    }

    fn get(key: &str, clerk_id: u64, op_id: u64) -> GetArgs {
        GetArgs {
            key: key.to_string(),
            clerk_id,
            op_id,
        }
    }

    #[tokio::test]
    async fn test_wrong_leader() {
        let fake = FakeConsensus::default();
        let (server, _apply_tx) = start(&fake, KvOptions::default());
        let started = time::Instant::now();
        let reply = server.get(get("x", 1, 0)).await;
        assert_eq!(reply.status, ReplyStatus::WrongLeader);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(fake.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_commit_releases_waiter() {
        let fake = FakeConsensus::leader(1);
        let (server, apply_tx) = start(&fake, KvOptions::default());

        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .put_append(put("x", "1", PutAppendOp::Put, 1, 0))
                    .await
            })
        };
        let submitted = fake.wait_submitted(1).await;
        let (index, data) = submitted[0].clone();
        apply_tx
            .send(ApplyMsg::Command { index, term: 1, data })
            .unwrap();
        assert_eq!(task.await.unwrap().status, ReplyStatus::Ok);

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.get(get("x", 1, 1)).await })
        };
        let submitted = fake.wait_submitted(2).await;
        let (index, data) = submitted[1].clone();
        apply_tx
            .send(ApplyMsg::Command { index, term: 1, data })
            .unwrap();
        let reply = task.await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.value, "1");
    }

    #[tokio::test]
    async fn test_term_mismatch_times_out() {
        let fake = FakeConsensus::leader(2);
        let (server, apply_tx) = start(&fake, short_timeout());

        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .put_append(put("k", "mine", PutAppendOp::Put, 1, 0))
                    .await
            })
        };
        let submitted = fake.wait_submitted(1).await;
        let index = submitted[0].0;

        // a later leader committed a different entry at the same index
        let foreign = Op::put(9, 0, "k".to_string(), "theirs".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index,
                term: 3,
                data: foreign,
            })
            .unwrap();

        assert_eq!(task.await.unwrap().status, ReplyStatus::Timeout);
        let state = server.applied_state().await.unwrap();
        assert_eq!(state.state.get("k").map(String::as_str), Some("theirs"));
        assert!(!state.dedup.contains_key(&1));
    }

    #[tokio::test]
    async fn test_nothing_commits_times_out() {
        let fake = FakeConsensus::leader(1);
        let (server, apply_tx) = start(&fake, short_timeout());
        let started = time::Instant::now();
        let reply = server
            .put_append(put("x", "late", PutAppendOp::Put, 1, 0))
            .await;
        assert_eq!(reply.status, ReplyStatus::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(server.pending.lock().await.waiters.is_empty());

        // the entry commits after its caller gave up
        let (index, data) = fake.submitted()[0].clone();
        apply_tx
            .send(ApplyMsg::Command { index, term: 1, data })
            .unwrap();
        let state = server.applied_state().await.unwrap();
        assert_eq!(state.last_index, index);
        assert_eq!(state.state.get("x").map(String::as_str), Some("late"));
        assert_eq!(state.dedup.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_retried_op_applied_once() {
        let fake = FakeConsensus::leader(1);
        let (server, apply_tx) = start(&fake, KvOptions::default());
        let data = Op::append(5, 7, "k".to_string(), "v".to_string())
            .encode()
            .unwrap();
        for index in 1..=2 {
            apply_tx
                .send(ApplyMsg::Command {
                    index,
                    term: 1,
                    data: data.clone(),
                })
                .unwrap();
        }
        let state = server.applied_state().await.unwrap();
        assert_eq!(state.last_index, 2);
        assert_eq!(state.state.get("k").map(String::as_str), Some("v"));
        assert_eq!(state.dedup.get(&5), Some(&8));
    }

    #[tokio::test]
    async fn test_snapshot_trigger() {
        let fake = FakeConsensus::leader(1);
        fake.state.lock().unwrap().raft_state_size = 100;
        let options = KvOptions {
            max_raft_state: 50,
            ..Default::default()
        };
        let (server, apply_tx) = start(&fake, options);
        let data = Op::put(1, 0, "a".to_string(), "1".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index: 4,
                term: 2,
                data,
            })
            .unwrap();
        server.applied_state().await.unwrap();

        let snapshots = fake.state.lock().unwrap().snapshots.clone();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].index, 4);
        assert_eq!(snapshots[0].term, 2);
        let image = KvSnapshot::decode(&snapshots[0].data).unwrap();
        assert_eq!(image.last_index, 4);
        assert_eq!(image.state.get("a").map(String::as_str), Some("1"));
        assert_eq!(image.dedup.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_snapshot_disabled() {
        let fake = FakeConsensus::leader(1);
        fake.state.lock().unwrap().raft_state_size = usize::MAX / 2;
        let (server, apply_tx) = start(&fake, KvOptions::default());
        let data = Op::put(1, 0, "a".to_string(), "1".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index: 1,
                term: 1,
                data,
            })
            .unwrap();
        server.applied_state().await.unwrap();
        assert!(fake.state.lock().unwrap().snapshots.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_install_replaces_state() {
        let fake = FakeConsensus::default();
        let (server, apply_tx) = start(&fake, KvOptions::default());
        let stale = Op::put(1, 0, "old".to_string(), "x".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index: 1,
                term: 1,
                data: stale,
            })
            .unwrap();

        let mut image = KvSnapshot {
            last_index: 500,
            last_term: 3,
            ..Default::default()
        };
        image.state.insert("x".to_string(), "snap".to_string());
        image.dedup.insert(2, 10);
        apply_tx
            .send(ApplyMsg::Snapshot {
                index: 500,
                term: 3,
                data: image.encode().unwrap(),
            })
            .unwrap();

        // covered by the snapshot
        let covered = Op::put(3, 0, "y".to_string(), "late".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index: 500,
                term: 3,
                data: covered,
            })
            .unwrap();
        let next = Op::append(2, 10, "x".to_string(), "+".to_string())
            .encode()
            .unwrap();
        apply_tx
            .send(ApplyMsg::Command {
                index: 501,
                term: 3,
                data: next,
            })
            .unwrap();

        let state = server.applied_state().await.unwrap();
        assert_eq!(state.last_index, 501);
        assert!(!state.state.contains_key("old"));
        assert!(!state.state.contains_key("y"));
        assert_eq!(state.state.get("x").map(String::as_str), Some("snap+"));
        assert_eq!(state.dedup.get(&2), Some(&11));
    }

    #[tokio::test]
    async fn test_killed_server_rejects() {
        let fake = FakeConsensus::leader(1);
        let (server, _apply_tx) = start(&fake, KvOptions::default());
        server.kill();
        assert!(server.is_killed());
        assert!(fake.state.lock().unwrap().shut_down);
        let reply = server.get(get("x", 1, 0)).await;
        assert_eq!(reply.status, ReplyStatus::WrongLeader);
    }

    #[test]
    fn test_pending_overwrite_and_deregister() {
        let mut pending = Pending::default();
        let (old_tx, mut old_rx) = oneshot::channel::<String>();
        let old = pending.register(5, 1, old_tx);
        let (new_tx, mut new_rx) = oneshot::channel();
        let new = pending.register(5, 2, new_tx);

        // displaced waiter stays parked, neither answered nor failed
        assert!(matches!(
            old_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert!(pending.superseded.contains_key(&old));

        assert!(!pending.complete(5, 1, "wrong".to_string()));
        assert!(pending.complete(5, 2, "right".to_string()));
        assert_eq!(new_rx.try_recv().unwrap(), "right");
        assert!(matches!(
            old_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        pending.deregister(5, new);
        pending.deregister(5, old);
        assert!(pending.waiters.is_empty());
        assert!(pending.superseded.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_caller_waits_full_timeout() {
        let fake = FakeConsensus::leader(1);
        let (server, _apply_tx) = start(&fake, short_timeout());

        let first = {
            let server = server.clone();
            tokio::spawn(async move {
                let started = time::Instant::now();
                let reply = server
                    .put_append(put("k", "a", PutAppendOp::Put, 1, 0))
                    .await;
                (reply, started.elapsed())
            })
        };
        fake.wait_submitted(1).await;

        // a new leader hands out the same index again
        {
            let mut state = fake.state.lock().unwrap();
            state.term = 2;
            state.last_index -= 1;
        }
        let second = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .put_append(put("k", "b", PutAppendOp::Put, 2, 0))
                    .await
            })
        };
        let submitted = fake.wait_submitted(2).await;
        assert_eq!(submitted[0].0, submitted[1].0);

        let (reply, elapsed) = first.await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Timeout);
        assert!(elapsed >= Duration::from_millis(200));
        assert_eq!(second.await.unwrap().status, ReplyStatus::Timeout);

        let pending = server.pending.lock().await;
        assert!(pending.waiters.is_empty());
        assert!(pending.superseded.is_empty());
    }
}
