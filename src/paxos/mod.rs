//! Consensus engine: basic Paxos re-run independently per instance.
//!
//! Every peer is at the same time a proposer, an acceptor, and a learner for
//! any number of independently-numbered instances. There is no stable
//! leader; competing proposers are ordered by round-robin ballot numbers.
//! References:
//!   - <https://www.microsoft.com/en-us/research/uploads/prod/2016/12/paxos-simple-Copy.pdf>
//!   - <https://pdos.csail.mit.edu/archive/6.824-2013/labs/lab-3.html>

mod acceptor;
mod instance;
mod messages;
mod proposer;
mod transport;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::utils::{KikuError, RpcHandler, RpcServer, tcp_bind_with_retry};

use async_trait::async_trait;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use tokio::sync::{Mutex, Notify};

use instance::InstanceTable;

pub use messages::{PeerMsg, PeerReply};
pub use transport::{FaultyTransport, PeerTransport, TcpTransport};

/// Replica (peer) ID type; also the peer's index in the cluster list.
pub type ReplicaId = u8;

/// Paxos instance ID type.
pub type InstanceId = u64;

/// Proposal (ballot) number type.
pub type Ballot = u64;

/// Opaque value type agreed upon by Paxos.
pub trait PaxosValue:
    fmt::Debug
    + Clone
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> PaxosValue for T where
    T: fmt::Debug
        + Clone
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct PaxosConfig {
    /// Fixed backoff between failed rounds in millisecs.
    pub backoff_ms: u64,

    /// Maximum random jitter added on top of the backoff in millisecs.
    pub backoff_jitter_ms: u64,

    /// Per-call timeout for an RPC to a peer in millisecs.
    pub rpc_timeout_ms: u64,

    /// Number of retries when binding the peer-peer listener.
    pub bind_retries: u8,
}

#[allow(clippy::derivable_impls)]
impl Default for PaxosConfig {
    fn default() -> Self {
        PaxosConfig {
            backoff_ms: 10,
            backoff_jitter_ms: 10,
            rpc_timeout_ms: 1000,
            bind_retries: 3,
        }
    }
}

/// One Paxos peer.
pub struct PaxosPeer<V> {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of peers in cluster.
    population: u8,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Configuration parameters struct.
    config: PaxosConfig,

    /// Instance table and peer progress table. This mutex is the phase lock:
    /// all acceptor handlers are serialized against each other.
    table: Mutex<InstanceTable<V>>,

    /// Proposer-side lock: I drive at most one of my own proposals at a time.
    propose_lock: Mutex<()>,

    /// Signalled whenever some instance newly becomes committed.
    commit_notify: Notify,

    /// RPC capability towards sibling peers.
    transport: Arc<dyn PeerTransport<V>>,

    /// Peer-peer request server.
    rpc_server: RpcServer,

    /// Set once shut down.
    closed: AtomicBool,
}

impl<V: PaxosValue> PaxosPeer<V> {
    /// Creates a new Paxos peer listening on `p2p_addrs[me]` and talking to
    /// siblings over plain TCP.
    pub async fn new_and_setup(
        me: ReplicaId,
        p2p_addrs: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, KikuError> {
        let transport = Arc::new(TcpTransport::new(p2p_addrs.clone()));
        Self::new_with_transport(me, p2p_addrs, transport, config_str).await
    }

    /// Creates a new Paxos peer listening on `p2p_addrs[me]` and talking to
    /// siblings through the given transport.
    pub async fn new_with_transport(
        me: ReplicaId,
        p2p_addrs: Vec<SocketAddr>,
        transport: Arc<dyn PeerTransport<V>>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, KikuError> {
        let config = parsed_config!(config_str => PaxosConfig;
                                    backoff_ms, backoff_jitter_ms,
                                    rpc_timeout_ms, bind_retries)?;
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                me;
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }
        if p2p_addrs.is_empty() || p2p_addrs.len() > u8::MAX as usize {
            return logged_err!(
                me;
                "invalid cluster population {}",
                p2p_addrs.len()
            );
        }
        if me as usize >= p2p_addrs.len() {
            return logged_err!(me; "invalid replica ID {}", me);
        }
        let population = p2p_addrs.len() as u8;

        let listener =
            tcp_bind_with_retry(p2p_addrs[me as usize], config.bind_retries)
                .await?;
        pf_info!(me; "paxos peer listening on '{}'", p2p_addrs[me as usize]);

        Ok(Arc::new_cyclic(|weak| PaxosPeer {
            me,
            population,
            quorum_cnt: (population / 2) + 1,
            config,
            table: Mutex::new(InstanceTable::new(me, population)),
            propose_lock: Mutex::new(()),
            commit_notify: Notify::new(),
            transport,
            rpc_server: RpcServer::spawn(me, listener, weak.clone()),
            closed: AtomicBool::new(false),
        }))
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.me
    }

    /// Starts driving given instance to agreement in the background, with
    /// `value` as my preferred value. Does nothing if the instance is already
    /// known committed or has been garbage collected.
    pub async fn propose(self: &Arc<Self>, inst: InstanceId, value: V) {
        if self.is_closed() {
            return;
        }

        {
            let mut table = self.table.lock().await;
            if inst < table.min_live() {
                pf_trace!(self.me; "propose for forgotten instance {} ignored",
                                   inst);
                return;
            }
            if table.get_or_create(inst).committed {
                return;
            }
        }

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            peer.run_proposal(inst, value).await;
        });
    }

    /// Non-blocking read of what I know about given instance. `(false, _)`
    /// means not yet known to be agreed.
    pub async fn query(&self, inst: InstanceId) -> (bool, Option<V>) {
        let table = self.table.lock().await;
        if inst < table.min_live() {
            return (false, None);
        }
        match table.get(inst) {
            Some(instance) => (instance.committed, instance.value.clone()),
            None => (false, None),
        }
    }

    /// Waits until given instance is known committed and returns its value.
    /// Returns `None` if the instance has been forgotten or I have been shut
    /// down in the meantime.
    pub async fn wait_committed(&self, inst: InstanceId) -> Option<V> {
        loop {
            let notified = self.commit_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let table = self.table.lock().await;
                if inst < table.min_live() {
                    return None;
                }
                if let Some(value) = table.committed_value(inst) {
                    return Some(value.clone());
                }
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Declares that the caller has fully processed every instance up to and
    /// including `inst`, then forgets whatever all peers are done with.
    pub async fn notify_done(&self, inst: InstanceId) {
        let mut table = self.table.lock().await;
        table.update_done(self.me, Some(inst));
        let released = table.collect_garbage();
        if released > 0 {
            pf_debug!(self.me; "released {} instances below {}, {} remain",
                               released, table.min_live(), table.len());
        }
    }

    /// Highest instance ID I hold any record of.
    pub async fn max_known_instance(&self) -> Option<InstanceId> {
        self.table.lock().await.max_known()
    }

    /// Instance ID below which everything has been forgotten.
    pub async fn min_live_instance(&self) -> InstanceId {
        self.table.lock().await.min_live()
    }

    /// Stops serving peers and releases the listening address. In-flight
    /// proposal rounds end on their next retry. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rpc_server.stop().await;
        self.commit_notify.notify_waiters();
        pf_info!(self.me; "paxos peer shut down");
    }

    /// Whether I have been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles one peer-peer message. Self-calls go through here exactly as
    /// remote calls do.
    pub(crate) async fn handle_msg(&self, msg: PeerMsg<V>) -> PeerReply<V> {
        let mut table = self.table.lock().await;
        match msg {
            PeerMsg::Prepare {
                inst,
                ballot,
                done,
                sender,
            } => {
                pf_trace!(self.me; "received Prepare <- {} for inst {} bal {}",
                                   sender, inst, ballot);
                if sender >= self.population {
                    pf_warn!(self.me; "Prepare from unknown peer {}", sender);
                }
                table.handle_prepare(inst, ballot, done, sender)
            }

            PeerMsg::Accept {
                inst,
                ballot,
                value,
            } => {
                pf_trace!(self.me; "received Accept for inst {} bal {}",
                                   inst, ballot);
                table.handle_accept(inst, ballot, value)
            }

            PeerMsg::Commit { inst, value } => {
                let (reply, newly) = table.handle_commit(inst, value);
                if newly {
                    pf_debug!(self.me; "committed instance {}", inst);
                    self.commit_notify.notify_waiters();
                }
                reply
            }
        }
    }
}

#[async_trait]
impl<V: PaxosValue> RpcHandler for PaxosPeer<V> {
    type Request = PeerMsg<V>;
    type Reply = PeerReply<V>;

    async fn handle(&self, req: PeerMsg<V>) -> PeerReply<V> {
        self.handle_msg(req).await
    }
}

#[cfg(test)]
mod paxos_tests {
    use super::*;
    use tokio::time::{self, Duration};

    fn test_addrs(base_port: u16, n: u8) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], base_port + i as u16)))
            .collect()
    }

    async fn make_cluster(
        base_port: u16,
        n: u8,
    ) -> Result<Vec<Arc<PaxosPeer<String>>>, KikuError> {
        let addrs = test_addrs(base_port, n);
        let mut peers = Vec::new();
        for me in 0..n {
            peers.push(PaxosPeer::new_and_setup(me, addrs.clone(), None).await?);
        }
        Ok(peers)
    }

    async fn make_faulty_cluster(
        base_port: u16,
        n: u8,
    ) -> Result<
        (
            Vec<Arc<PaxosPeer<String>>>,
            Vec<Arc<FaultyTransport<TcpTransport>>>,
        ),
        KikuError,
    > {
        let addrs = test_addrs(base_port, n);
        let mut peers = Vec::new();
        let mut transports = Vec::new();
        for me in 0..n {
            let transport =
                Arc::new(FaultyTransport::new(TcpTransport::new(addrs.clone())));
            peers.push(
                PaxosPeer::new_with_transport(
                    me,
                    addrs.clone(),
                    transport.clone(),
                    None,
                )
                .await?,
            );
            transports.push(transport);
        }
        Ok((peers, transports))
    }

    async fn shutdown_all(peers: &[Arc<PaxosPeer<String>>]) {
        for peer in peers {
            peer.shutdown().await;
        }
    }

    /// Counts peers that know `inst` committed, checking that they all agree.
    async fn ndecided(peers: &[Arc<PaxosPeer<String>>], inst: InstanceId) -> usize {
        let mut count = 0;
        let mut agreed: Option<String> = None;
        for peer in peers {
            if let (true, Some(v)) = peer.query(inst).await {
                if let Some(ref a) = agreed {
                    assert_eq!(a, &v, "decided values differ at inst {}", inst);
                }
                agreed = Some(v);
                count += 1;
            }
        }
        count
    }

    async fn wait_decided(
        peers: &[Arc<PaxosPeer<String>>],
        inst: InstanceId,
        wanted: usize,
    ) {
        let mut to = Duration::from_millis(10);
        for _ in 0..30 {
            if ndecided(peers, inst).await >= wanted {
                break;
            }
            time::sleep(to).await;
            if to < Duration::from_secs(1) {
                to *= 2;
            }
        }
        let nd = ndecided(peers, inst).await;
        assert!(nd >= wanted, "too few decided at {}: {} < {}", inst, nd, wanted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_proposer() -> Result<(), KikuError> {
        let peers = make_cluster(23000, 3).await?;
        peers[0].propose(0, "hello".into()).await;
        wait_decided(&peers, 0, 3).await;
        for peer in &peers {
            assert_eq!(peer.query(0).await, (true, Some("hello".into())));
        }
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_proposers_same_value() -> Result<(), KikuError> {
        let peers = make_cluster(23020, 3).await?;
        for peer in &peers {
            peer.propose(1, "77".into()).await;
        }
        wait_decided(&peers, 1, 3).await;
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_proposers_different_values() -> Result<(), KikuError> {
        let peers = make_cluster(23040, 3).await?;
        peers[0].propose(2, "100".into()).await;
        peers[1].propose(2, "101".into()).await;
        peers[2].propose(2, "102".into()).await;
        wait_decided(&peers, 2, 3).await;
        let (_, v) = peers[0].query(2).await;
        let v = v.unwrap();
        assert!(["100", "101", "102"].contains(&v.as_str()));
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_instances() -> Result<(), KikuError> {
        let peers = make_cluster(23060, 3).await?;
        peers[0].propose(7, "700".into()).await;
        peers[0].propose(6, "600".into()).await;
        peers[1].propose(5, "500".into()).await;
        wait_decided(&peers, 7, 3).await;
        peers[0].propose(4, "400".into()).await;
        peers[1].propose(3, "300".into()).await;
        for inst in [6, 5, 4, 3] {
            wait_decided(&peers, inst, 3).await;
        }
        assert_eq!(peers[0].max_known_instance().await, Some(7));
        assert_eq!(peers[1].query(4).await, (true, Some("400".into())));
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_on_committed_is_noop() -> Result<(), KikuError> {
        let peers = make_cluster(23080, 3).await?;
        peers[1].propose(0, "first".into()).await;
        wait_decided(&peers, 0, 3).await;
        peers[2].propose(0, "second".into()).await;
        time::sleep(Duration::from_millis(200)).await;
        for peer in &peers {
            assert_eq!(peer.query(0).await, (true, Some("first".into())));
        }
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_committed_wakes_up() -> Result<(), KikuError> {
        let peers = make_cluster(23100, 3).await?;
        let waiter = {
            let peer = peers[2].clone();
            tokio::spawn(async move { peer.wait_committed(3).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        peers[0].propose(3, "woken".into()).await;
        let got = time::timeout(Duration::from_secs(10), waiter).await??;
        assert_eq!(got, Some("woken".into()));
        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deaf_peers() -> Result<(), KikuError> {
        let n = 5;
        let (peers, transports) = make_faulty_cluster(23120, n).await?;
        peers[0].propose(0, "hello".into()).await;
        wait_decided(&peers, 0, n as usize).await;

        // nobody can reach peers 0 and 4 anymore, though they can still
        // reach everyone else
        for (i, t) in transports.iter().enumerate() {
            if i != 0 {
                t.block(0);
            }
            if i != 4 {
                t.block(4);
            }
        }

        peers[1].propose(1, "goodbye".into()).await;
        wait_decided(&peers, 1, 3).await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ndecided(&peers, 1).await, 3, "a deaf peer heard decision");

        peers[0].propose(1, "xxx".into()).await;
        wait_decided(&peers, 1, 4).await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ndecided(&peers, 1).await, 4);

        peers[4].propose(1, "yyy".into()).await;
        wait_decided(&peers, 1, 5).await;
        assert_eq!(peers[4].query(1).await, (true, Some("goodbye".into())));

        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn minority_stays_silent() -> Result<(), KikuError> {
        let n = 5;
        let (peers, transports) = make_faulty_cluster(23140, n).await?;

        // partition {0, 1} from {2, 3, 4}
        for (i, t) in transports.iter().enumerate() {
            for j in 0..n {
                if (i < 2) != (j < 2) {
                    t.block(j);
                }
            }
        }

        peers[0].propose(0, "minority".into()).await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ndecided(&peers, 0).await, 0);

        peers[3].propose(1, "majority".into()).await;
        wait_decided(&peers, 1, 3).await;

        // heal: the minority's pending round can now finish too, and it
        // learns instance 1 by asking again
        for t in &transports {
            t.heal();
        }
        wait_decided(&peers, 0, n as usize).await;
        peers[0].propose(1, "late".into()).await;
        peers[1].propose(1, "late".into()).await;
        wait_decided(&peers, 1, n as usize).await;
        assert_eq!(peers[0].query(1).await, (true, Some("majority".into())));

        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unreliable_network() -> Result<(), KikuError> {
        let n = 3;
        let (peers, transports) = make_faulty_cluster(23160, n).await?;
        for t in &transports {
            t.set_drop_rate(30);
        }

        for inst in 0..5 {
            for (i, peer) in peers.iter().enumerate() {
                peer.propose(inst, format!("{}-{}", inst, i)).await;
            }
        }
        for inst in 0..5 {
            wait_decided(&peers, inst, 1).await;
        }

        // once the network recovers, everyone learns the same values
        for t in &transports {
            t.heal();
        }
        for inst in 0..5 {
            for (i, peer) in peers.iter().enumerate() {
                peer.propose(inst, format!("late-{}", i)).await;
            }
            wait_decided(&peers, inst, n as usize).await;
            let (_, v) = peers[0].query(inst).await;
            assert!(!v.unwrap().starts_with("late"));
        }

        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn forgetting() -> Result<(), KikuError> {
        let n = 6;
        let peers = make_cluster(23180, n).await?;

        for peer in &peers {
            assert_eq!(peer.min_live_instance().await, 0);
        }

        peers[0].propose(0, "00".into()).await;
        peers[1].propose(1, "11".into()).await;
        peers[2].propose(2, "22".into()).await;
        peers[0].propose(6, "66".into()).await;
        peers[1].propose(7, "77".into()).await;
        wait_decided(&peers, 0, n as usize).await;
        for peer in &peers {
            assert_eq!(peer.min_live_instance().await, 0);
        }

        wait_decided(&peers, 1, n as usize).await;
        for peer in &peers {
            peer.notify_done(0).await;
        }
        for peer in &peers[1..] {
            peer.notify_done(1).await;
        }

        // every peer proposes once so that its done progress gets gossiped
        for (i, peer) in peers.iter().enumerate() {
            peer.propose(8 + i as InstanceId, "xx".into()).await;
        }
        for i in 0..n {
            wait_decided(&peers, 8 + i as InstanceId, n as usize).await;
        }
        for peer in &peers {
            assert_eq!(peer.min_live_instance().await, 1);
            assert_eq!(peer.query(0).await, (false, None));
            assert_eq!(peer.query(1).await.0, true);
        }

        // a proposal for a forgotten instance is ignored
        peers[3].propose(0, "again".into()).await;
        assert_eq!(peers[3].query(0).await, (false, None));

        peers[0].notify_done(1).await;
        for peer in &peers {
            peer.propose(20 + peer.id() as InstanceId, "yy".into()).await;
        }
        for i in 0..n {
            wait_decided(&peers, 20 + i as InstanceId, n as usize).await;
        }
        for peer in &peers {
            assert_eq!(peer.min_live_instance().await, 2);
            assert_eq!(peer.query(1).await, (false, None));
        }

        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restart_learns_again() -> Result<(), KikuError> {
        let n = 5;
        let addrs = test_addrs(23200, n);
        let mut peers = make_cluster(23200, n).await?;

        peers[4].shutdown().await;
        peers[0].propose(0, "while-down".into()).await;
        wait_decided(&peers[..4], 0, 4).await;
        assert_eq!(peers[4].query(0).await, (false, None));

        // restarted peer starts empty and learns by being asked again
        peers[4] = PaxosPeer::new_and_setup(4, addrs, None).await?;
        assert_eq!(peers[4].query(0).await, (false, None));
        peers[4].propose(0, "mine".into()).await;
        wait_decided(&peers, 0, n as usize).await;
        assert_eq!(peers[4].query(0).await, (true, Some("while-down".into())));

        shutdown_all(&peers).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_setup() -> Result<(), KikuError> {
        let addrs = test_addrs(23220, 3);
        assert!(PaxosPeer::<String>::new_and_setup(3, addrs.clone(), None)
            .await
            .is_err());
        assert!(PaxosPeer::<String>::new_and_setup(
            0,
            addrs.clone(),
            Some("rpc_timeout_ms = 0")
        )
        .await
        .is_err());

        // address already taken
        let first = PaxosPeer::<String>::new_and_setup(
            0,
            addrs.clone(),
            Some("bind_retries = 0"),
        )
        .await?;
        assert!(PaxosPeer::<String>::new_and_setup(
            0,
            addrs,
            Some("bind_retries = 0")
        )
        .await
        .is_err());
        first.shutdown().await;
        Ok(())
    }
}
