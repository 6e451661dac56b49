//! Kiku replicated key-value store server.
//!
//! Every client call is sequenced through successive Paxos instances: the
//! server proposes the call's request at its next free instance, waits for
//! that instance to commit, applies whatever committed, and retries at the
//! following instance until its own request is the one that committed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::utils::{KikuError, RpcHandler, RpcServer, tcp_bind_with_retry};
use crate::paxos::{
    InstanceId, PaxosPeer, PeerTransport, ReplicaId, TcpTransport,
};
use crate::server::{
    ApiReply, ApiRequest, Command, CommandResult, LogRecord, RecoveryLog,
    Request, RequestId, RequesterId, StateMachine,
};

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::Mutex;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Whether to keep a recovery log and replay it on startup.
    pub persist: bool,

    /// Directory of the recovery log file.
    pub backer_dir: String,

    /// Explicit path of the recovery log file; if empty, the path is
    /// `<backer_dir>/kiku.<api port>.log`.
    pub backer_path: String,

    /// Whether to fsync after every log append.
    pub logger_sync: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            persist: false,
            backer_dir: "/tmp".into(),
            backer_path: "".into(),
            logger_sync: false,
        }
    }
}

/// State guarded by the ordering lock: exactly one client call is being
/// sequenced at a time.
struct Sequencer {
    /// Next free Paxos instance ID to propose into.
    rid: InstanceId,

    /// Recovery log, if persistence is enabled.
    backer: Option<RecoveryLog>,
}

/// Replicated key-value store server node.
pub struct KvServer {
    /// My replica ID.
    me: ReplicaId,

    /// Consensus engine.
    paxos: Arc<PaxosPeer<Request>>,

    /// Key-value state machine.
    state: StateMachine,

    /// Ordering lock over the instance counter and the recovery log.
    sequencer: Mutex<Sequencer>,

    /// Mirror of the instance counter, readable without taking the
    /// ordering lock.
    rid_mirror: AtomicU64,

    /// Client-facing API server.
    api_server: RpcServer,

    /// Set once closed.
    closed: AtomicBool,
}

// KvServer public API implementation
impl KvServer {
    /// Creates a new server node: replays the recovery log if configured,
    /// sets up the Paxos peer on `p2p_addrs[me]`, and starts serving clients
    /// on `api_addrs[me]`.
    pub async fn new_and_setup(
        me: ReplicaId,
        api_addrs: Vec<SocketAddr>,
        p2p_addrs: Vec<SocketAddr>,
        config_str: Option<&str>,
        paxos_config_str: Option<&str>,
    ) -> Result<Arc<Self>, KikuError> {
        let transport = Arc::new(TcpTransport::new(p2p_addrs.clone()));
        Self::new_with_transport(
            me,
            api_addrs,
            p2p_addrs,
            transport,
            config_str,
            paxos_config_str,
        )
        .await
    }

    /// Same as `new_and_setup()`, but the Paxos peer talks to its siblings
    /// through the given transport.
    pub async fn new_with_transport(
        me: ReplicaId,
        api_addrs: Vec<SocketAddr>,
        p2p_addrs: Vec<SocketAddr>,
        transport: Arc<dyn PeerTransport<Request>>,
        config_str: Option<&str>,
        paxos_config_str: Option<&str>,
    ) -> Result<Arc<Self>, KikuError> {
        let config = parsed_config!(config_str => ServerConfig;
                                    persist, backer_dir, backer_path,
                                    logger_sync)?;
        if api_addrs.len() != p2p_addrs.len() {
            return logged_err!(
                me;
                "api_addrs and p2p_addrs length mismatch: {} != {}",
                api_addrs.len(),
                p2p_addrs.len()
            );
        }
        if me as usize >= api_addrs.len() {
            return logged_err!(me; "invalid replica ID {}", me);
        }
        let api_addr = api_addrs[me as usize];

        // replay recovery log if persistence is enabled
        let state = StateMachine::new(me);
        let mut rid: InstanceId = 0;
        let backer = if config.persist {
            let path = if config.backer_path.is_empty() {
                PathBuf::from(&config.backer_dir)
                    .join(format!("kiku.{}.log", api_addr.port()))
            } else {
                PathBuf::from(&config.backer_path)
            };
            let (backer, records) =
                RecoveryLog::open(me, &path, config.logger_sync).await?;
            for record in &records {
                state.apply(&record.req).await;
                rid = rid.max(record.inst + 1);
            }
            pf_info!(me; "recovered {} keys from '{}', resuming at instance {}",
                         state.num_keys().await, backer.path().display(), rid);
            Some(backer)
        } else {
            None
        };

        let paxos = PaxosPeer::new_with_transport(
            me,
            p2p_addrs,
            transport,
            paxos_config_str,
        )
        .await?;

        let listener = match tcp_bind_with_retry(api_addr, 3).await {
            Ok(listener) => listener,
            Err(e) => {
                paxos.shutdown().await;
                return logged_err!(me; "error binding API '{}': {}", api_addr, e);
            }
        };
        pf_info!(me; "accepting clients on '{}'", api_addr);

        Ok(Arc::new_cyclic(|weak| KvServer {
            me,
            paxos,
            state,
            sequencer: Mutex::new(Sequencer { rid, backer }),
            rid_mirror: AtomicU64::new(rid),
            api_server: RpcServer::spawn(me, listener, weak.clone()),
            closed: AtomicBool::new(false),
        }))
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.me
    }

    /// Sets `key` to `value` on behalf of given request, deduplicated by the
    /// request's identity. Returns once the request has been ordered and
    /// applied locally.
    pub async fn put(
        &self,
        requester: RequesterId,
        req_id: RequestId,
        key: String,
        value: String,
    ) -> Result<(), KikuError> {
        let req = Request {
            requester,
            req_id,
            cmd: Command::Put { key, value },
        };
        match self.sequence(req).await? {
            CommandResult::Put { .. } => Ok(()),
            result => logged_err!(self.me; "unexpected result {:?}", result),
        }
    }

    /// Reads `key` at the position in the log where this request gets
    /// ordered. Returns `None` if no committed Put ever set it.
    pub async fn get(
        &self,
        requester: RequesterId,
        req_id: RequestId,
        key: String,
    ) -> Result<Option<String>, KikuError> {
        let req = Request {
            requester,
            req_id,
            cmd: Command::Get { key },
        };
        match self.sequence(req).await? {
            CommandResult::Get { value } => Ok(value),
            result => logged_err!(self.me; "unexpected result {:?}", result),
        }
    }

    /// The next free instance ID this server will propose into.
    pub fn storage_size(&self) -> u64 {
        self.rid_mirror.load(Ordering::SeqCst)
    }

    /// Stops serving clients and shuts down the Paxos peer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.api_server.stop().await;
        self.paxos.shutdown().await;
        pf_info!(self.me; "server closed");
    }

    /// Whether I have been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// KvServer sequencing implementation
impl KvServer {
    /// Drives given request through consensus: propose, wait, apply, check,
    /// and retry at the next instance until my request is the one committed.
    async fn sequence(&self, req: Request) -> Result<CommandResult, KikuError> {
        if self.is_closed() {
            return Err(KikuError::msg("server closed"));
        }
        let mut seq = self.sequencer.lock().await;

        loop {
            let inst = seq.rid;
            self.paxos.propose(inst, req.clone()).await;
            let committed = match self.paxos.wait_committed(inst).await {
                Some(committed) => committed,
                None => {
                    return logged_err!(
                        self.me;
                        "instance {} unavailable while sequencing {:?}",
                        inst,
                        req
                    );
                }
            };

            // whatever committed here is applied, even if it is not mine
            if let Some(backer) = seq.backer.as_mut() {
                backer
                    .append(&LogRecord {
                        inst,
                        req: committed.clone(),
                    })
                    .await?;
            }
            let result = self.state.apply(&committed).await;
            seq.rid = inst + 1;
            self.rid_mirror.store(seq.rid, Ordering::SeqCst);

            if committed.identity() == req.identity() {
                pf_debug!(self.me; "sequenced {:?} at instance {}", req, inst);
                self.paxos.notify_done(inst).await;
                return Ok(result);
            }
            pf_debug!(self.me; "instance {} taken by {:?}, retrying",
                               inst, committed);
        }
    }
}

#[async_trait]
impl RpcHandler for KvServer {
    type Request = ApiRequest;
    type Reply = ApiReply;

    async fn handle(&self, req: ApiRequest) -> ApiReply {
        pf_trace!(self.me; "api request {:?}", req);
        match req {
            ApiRequest::Put {
                requester,
                req_id,
                key,
                value,
            } => match self.put(requester, req_id, key, value).await {
                Ok(()) => ApiReply::Put { ok: true },
                Err(e) => ApiReply::Error { msg: e.to_string() },
            },

            ApiRequest::Get {
                requester,
                req_id,
                key,
            } => match self.get(requester, req_id, key).await {
                Ok(value) => ApiReply::Get {
                    ok: value.is_some(),
                    value,
                },
                Err(e) => ApiReply::Error { msg: e.to_string() },
            },

            ApiRequest::StorageSize => ApiReply::StorageSize {
                size: self.storage_size(),
            },
        }
    }
}
