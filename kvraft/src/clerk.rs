//! Client side: the [`KvService`] seam, a TCP implementation of it, and the
//! [`Clerk`] retry loop that turns at-least-once delivery into exactly-once
//! effects by reusing one op id per logical operation.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};

use crate::error::{Error, Result};
use crate::kv_server::KvServer;
use crate::raft::Consensus;
use crate::rpc::{
    self, FramedStream, GetArgs, GetReply, KvRequest, KvResponse, PutAppendArgs, PutAppendOp, PutAppendReply,
    ReplyStatus,
};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub trait KvService: Send + Sync + 'static {
    fn get(&self, args: GetArgs) -> impl Future<Output = Result<GetReply>> + Send;
    fn put_append(
        &self,
        args: PutAppendArgs,
    ) -> impl Future<Output = Result<PutAppendReply>> + Send;
}

impl<C: Consensus> KvService for KvServer<C> {
    async fn get(&self, args: GetArgs) -> Result<GetReply> {
        Ok(KvServer::get(self, args).await)
    }

    async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply> {
        Ok(KvServer::put_append(self, args).await)
    }
}

impl<T: KvService> KvService for Arc<T> {
    fn get(&self, args: GetArgs) -> impl Future<Output = Result<GetReply>> + Send {
        (**self).get(args)
    }

    fn put_append(
        &self,
        args: PutAppendArgs,
    ) -> impl Future<Output = Result<PutAppendReply>> + Send {
        (**self).put_append(args)
    }
}

/// One server reached over TCP. The connection is opened lazily and dropped
/// after any transport error.
pub struct RemoteKv {
    addr: String,
    conn: Mutex<Option<FramedStream<TcpStream>>>,
    request_timeout: Duration,
}

impl RemoteKv {
    pub fn new(addr: impl Into<String>) -> Self {
        RemoteKv {
            addr: addr.into(),
            conn: Mutex::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, request: KvRequest) -> Result<KvResponse> {
        let mut conn = self.conn.lock().await;
        time::timeout(self.request_timeout, async {
            // taken out so that a failed exchange leaves no connection behind
            let mut stream = match conn.take() {
                Some(stream) => stream,
                None => rpc::framed(TcpStream::connect(&self.addr).await?),
            };
            rpc::send_message(&mut stream, &request).await?;
            let response = rpc::next_message::<_, KvResponse>(&mut stream).await?;
            *conn = Some(stream);
            response.ok_or_else(|| Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
        })
        .await
        .unwrap_or_else(|_| Err(Error::Io(std::io::ErrorKind::TimedOut.into())))
    }
}

fn unexpected_response() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "response does not match request",
    ))
}

impl KvService for RemoteKv {
    async fn get(&self, args: GetArgs) -> Result<GetReply> {
        match self.call(KvRequest::Get(args)).await? {
            KvResponse::Get(reply) => Ok(reply),
            KvResponse::PutAppend(_) => Err(unexpected_response()),
        }
    }

    async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply> {
        match self.call(KvRequest::PutAppend(args)).await? {
            KvResponse::PutAppend(reply) => Ok(reply),
            KvResponse::Get(_) => Err(unexpected_response()),
        }
    }
}

/// Issues one operation at a time and retries it until some server commits
/// it. All retries of an operation carry the same op id.
pub struct Clerk<S: KvService> {
    servers: Vec<S>,
    clerk_id: u64,
    next_op_id: u64,
    leader: usize,
    backoff: Duration,
}

impl<S: KvService> Clerk<S> {
    /// # Panics
    ///
    /// Panics if `servers` is empty. Callers check their address lists
    /// before building a clerk.
    pub fn new(servers: Vec<S>) -> Self {
        assert!(!servers.is_empty(), "clerk needs at least one server");
        Clerk {
            servers,
            clerk_id: rand::random(),
            next_op_id: 0,
            leader: 0,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn clerk_id(&self) -> u64 {
        self.clerk_id
    }

    /// Value of `key`, empty when absent.
    pub async fn get(&mut self, key: &str) -> String {
        let args = GetArgs {
            key: key.to_string(),
            clerk_id: self.clerk_id,
            op_id: self.take_op_id(),
        };
        let mut attempts = 0usize;
        loop {
            let reply = self.servers[self.leader].get(args.clone()).await;
            match reply {
                Ok(GetReply {
                    status: ReplyStatus::Ok,
                    value,
                }) => return value,
                Ok(reply) => self.on_failure(reply.status, &mut attempts).await,
                Err(e) => self.on_transport_error(e, &mut attempts).await,
            }
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append).await
    }

    async fn put_append(&mut self, key: &str, value: &str, op: PutAppendOp) {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            clerk_id: self.clerk_id,
            op_id: self.take_op_id(),
        };
        let mut attempts = 0usize;
        loop {
            let reply = self.servers[self.leader].put_append(args.clone()).await;
            match reply {
                Ok(PutAppendReply {
                    status: ReplyStatus::Ok,
                }) => return,
                Ok(reply) => self.on_failure(reply.status, &mut attempts).await,
                Err(e) => self.on_transport_error(e, &mut attempts).await,
            }
        }
    }

    fn take_op_id(&mut self) -> u64 {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        op_id
    }

    async fn on_failure(&mut self, status: ReplyStatus, attempts: &mut usize) {
        log::debug!(
            "clerk {} got {:?} from server {}",
            self.clerk_id,
            status,
            self.leader
        );
        if status == ReplyStatus::Timeout {
            time::sleep(self.backoff).await;
        }
        self.next_server(attempts).await;
    }

    async fn on_transport_error(&mut self, e: Error, attempts: &mut usize) {
        log::debug!(
            "clerk {} failed to reach server {}: {}",
            self.clerk_id,
            self.leader,
            e
        );
        time::sleep(self.backoff).await;
        self.next_server(attempts).await;
    }

    // Pauses after every full sweep so a leaderless cluster is not hammered.
    async fn next_server(&mut self, attempts: &mut usize) {
        *attempts += 1;
        self.leader = (self.leader + 1) % self.servers.len();
        if *attempts % self.servers.len() == 0 {
            time::sleep(self.backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{KvStore, Op};
    use std::sync::Mutex as StdMutex;

    /// Serves from a local store after failing a scripted number of times.
    struct ScriptedServer {
        script: StdMutex<Vec<ReplyStatus>>,
        store: Arc<StdMutex<KvStore>>,
        seen: StdMutex<Vec<(u64, u64)>>,
    }

    impl ScriptedServer {
        fn new(script: Vec<ReplyStatus>, store: Arc<StdMutex<KvStore>>) -> Self {
            ScriptedServer {
                script: StdMutex::new(script),
                store,
                seen: StdMutex::new(Vec::new()),
            }
        }

        fn next_status(&self) -> ReplyStatus {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                ReplyStatus::Ok
            } else {
                script.remove(0)
            }
        }
    }

    impl KvService for ScriptedServer {
        async fn get(&self, args: GetArgs) -> Result<GetReply> {
            self.seen.lock().unwrap().push((args.clerk_id, args.op_id));
            let status = self.next_status();
            if status != ReplyStatus::Ok {
                return Ok(GetReply::with_status(status));
            }
            let value = self.store.lock().unwrap().apply(&args.into());
            Ok(GetReply { status, value })
        }

        async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply> {
            self.seen.lock().unwrap().push((args.clerk_id, args.op_id));
            let op: Op = args.into();
            // the write lands even when the reply is lost
            self.store.lock().unwrap().apply(&op);
            Ok(PutAppendReply {
                status: self.next_status(),
            })
        }
    }

    #[tokio::test]
    async fn test_clerk_finds_leader() {
        let store = Arc::new(StdMutex::new(KvStore::new()));
        let servers = vec![
            Arc::new(ScriptedServer::new(vec![ReplyStatus::WrongLeader; 10], store.clone())),
            Arc::new(ScriptedServer::new(Vec::new(), store.clone())),
        ];
        let mut clerk = Clerk::new(servers.clone()).with_backoff(Duration::from_millis(1));
        clerk.put("x", "1").await;
        clerk.append("x", "2").await;
        assert_eq!(clerk.get("x").await, "12");
        assert_eq!(servers[0].seen.lock().unwrap().len(), 1);
        assert_eq!(servers[1].seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_reuses_op_id() {
        let store = Arc::new(StdMutex::new(KvStore::new()));
        let server = Arc::new(ScriptedServer::new(
            vec![ReplyStatus::Timeout, ReplyStatus::Timeout],
            store.clone(),
        ));
        let mut clerk = Clerk::new(vec![server.clone()]).with_backoff(Duration::from_millis(1));
        clerk.append("k", "v").await;

        let seen = server.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&(c, op)| c == clerk.clerk_id() && op == 0));
        assert_eq!(store.lock().unwrap().get("k"), "v");
    }

    #[test]
    #[should_panic(expected = "clerk needs at least one server")]
    fn test_clerk_without_servers_panics() {
        let _ = Clerk::<Arc<ScriptedServer>>::new(Vec::new());
    }
}
