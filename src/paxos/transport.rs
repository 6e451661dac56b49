//! Paxos -- point-to-point RPC capability towards sibling peers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::messages::{PeerMsg, PeerReply};
use super::{PaxosValue, ReplicaId};

use crate::utils::{KikuError, read_frame, write_frame};

use async_trait::async_trait;

use rand::Rng;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Calls a named method on a peer. Failures are reported as errors; there
/// is no guaranteed delivery or ordering, and the caller never retries an
/// individual message.
#[async_trait]
pub trait PeerTransport<V>: Send + Sync {
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg<V>,
    ) -> Result<PeerReply<V>, KikuError>;
}

/// TCP transport keeping one long-lived connection per peer. A connection
/// that fails is dropped and re-dialed, so a restarted peer at the same
/// address becomes reachable again.
#[derive(Debug)]
pub struct TcpTransport {
    /// Map from peer ID -> its peer-peer address.
    peer_addrs: Vec<SocketAddr>,

    /// Map from peer ID -> cached connection to it, if any.
    conns: Vec<Mutex<Option<TcpStream>>>,
}

impl TcpTransport {
    /// Creates a TCP transport over the full cluster address list. No
    /// connection is made until the first call to each peer.
    pub fn new(peer_addrs: Vec<SocketAddr>) -> Self {
        let conns = peer_addrs.iter().map(|_| Mutex::new(None)).collect();
        TcpTransport { peer_addrs, conns }
    }

    /// Sends one message over `conn` and waits for its reply.
    async fn exchange<V: PaxosValue>(
        conn: &mut TcpStream,
        msg: &PeerMsg<V>,
    ) -> Result<PeerReply<V>, KikuError> {
        write_frame(conn, msg).await?;
        read_frame(conn).await
    }
}

#[async_trait]
impl<V: PaxosValue> PeerTransport<V> for TcpTransport {
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg<V>,
    ) -> Result<PeerReply<V>, KikuError> {
        let (addr, slot) = match (
            self.peer_addrs.get(peer as usize),
            self.conns.get(peer as usize),
        ) {
            (Some(addr), Some(slot)) => (*addr, slot),
            _ => {
                return Err(KikuError(format!(
                    "peer ID {} has no known address",
                    peer
                )))
            }
        };

        // the connection is taken out while in use, so a call cancelled
        // midway never leaves an unread reply on a cached connection
        let mut slot = slot.lock().await;
        if let Some(mut conn) = slot.take() {
            if let Ok(reply) = Self::exchange(&mut conn, &msg).await {
                *slot = Some(conn);
                return Ok(reply);
            }
            // stale connection, e.g. the peer has restarted
        }

        let mut conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        let reply = Self::exchange(&mut conn, &msg).await?;
        *slot = Some(conn);
        Ok(reply)
    }
}

/// Fault-injecting wrapper over another transport, for testing under an
/// unreliable network. A dropped call may lose either the request (never
/// delivered) or the reply (delivered and applied remotely, but reported
/// as failed). Blocked peers are unreachable altogether.
#[derive(Debug)]
pub struct FaultyTransport<T> {
    inner: T,

    /// Percentage of calls to drop, in [0, 100].
    drop_pct: AtomicU8,

    /// Bit `i` set means peer `i` is unreachable.
    blocked: AtomicU64,
}

impl<T> FaultyTransport<T> {
    /// Wraps `inner` with no faults injected initially.
    pub fn new(inner: T) -> Self {
        FaultyTransport {
            inner,
            drop_pct: AtomicU8::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Sets the percentage of calls to drop.
    pub fn set_drop_rate(&self, pct: u8) {
        self.drop_pct.store(pct.min(100), Ordering::Relaxed);
    }

    /// Makes given peer unreachable through this transport.
    pub fn block(&self, peer: ReplicaId) {
        debug_assert!(peer < 64);
        self.blocked.fetch_or(1 << peer, Ordering::Relaxed);
    }

    /// Makes given peer reachable again.
    pub fn unblock(&self, peer: ReplicaId) {
        debug_assert!(peer < 64);
        self.blocked.fetch_and(!(1 << peer), Ordering::Relaxed);
    }

    /// Clears all injected faults.
    pub fn heal(&self) {
        self.drop_pct.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
    }

    fn is_blocked(&self, peer: ReplicaId) -> bool {
        peer < 64 && self.blocked.load(Ordering::Relaxed) & (1 << peer) != 0
    }
}

#[async_trait]
impl<V, T> PeerTransport<V> for FaultyTransport<T>
where
    V: PaxosValue,
    T: PeerTransport<V>,
{
    async fn call(
        &self,
        peer: ReplicaId,
        msg: PeerMsg<V>,
    ) -> Result<PeerReply<V>, KikuError> {
        if self.is_blocked(peer) {
            return Err(KikuError(format!("peer {} unreachable", peer)));
        }

        // decide the fate of this call before any await point
        let (drop_req, drop_reply) = {
            let pct = self.drop_pct.load(Ordering::Relaxed) as u32;
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..100) < pct, rng.gen_range(0..100) < pct)
        };
        if drop_req {
            return Err(KikuError(format!("request to {} dropped", peer)));
        }

        let reply = self.inner.call(peer, msg).await?;
        if drop_reply {
            return Err(KikuError(format!("reply from {} dropped", peer)));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use crate::utils::{RpcHandler, RpcServer, tcp_bind_with_retry};
    use tokio::net::TcpListener;

    /// Transport that answers every call locally and counts deliveries.
    struct Echo {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl PeerTransport<String> for Echo {
        async fn call(
            &self,
            _peer: ReplicaId,
            _msg: PeerMsg<String>,
        ) -> Result<PeerReply<String>, KikuError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(PeerReply::Commit { ok: true })
        }
    }

    fn commit_msg() -> PeerMsg<String> {
        PeerMsg::Commit {
            inst: 0,
            value: "v".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn block_and_unblock() {
        let t = FaultyTransport::new(Echo {
            delivered: AtomicUsize::new(0),
        });
        assert!(t.call(2, commit_msg()).await.is_ok());
        t.block(2);
        assert!(t.call(2, commit_msg()).await.is_err());
        assert!(t.call(1, commit_msg()).await.is_ok());
        t.unblock(2);
        assert!(t.call(2, commit_msg()).await.is_ok());
        assert_eq!(t.inner.delivered.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn drop_everything() {
        let t = FaultyTransport::new(Echo {
            delivered: AtomicUsize::new(0),
        });
        t.set_drop_rate(100);
        for _ in 0..20 {
            assert!(t.call(0, commit_msg()).await.is_err());
        }
        assert_eq!(t.inner.delivered.load(Ordering::SeqCst), 0);
        t.heal();
        assert!(t.call(0, commit_msg()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn drop_some() {
        let t = FaultyTransport::new(Echo {
            delivered: AtomicUsize::new(0),
        });
        t.set_drop_rate(50);
        let mut failed = 0;
        for _ in 0..200 {
            if t.call(0, commit_msg()).await.is_err() {
                failed += 1;
            }
        }
        // each call survives with probability 1/4
        assert!(failed > 100 && failed < 200);
    }

    /// Handler acknowledging every Commit.
    struct Acker;

    #[async_trait]
    impl RpcHandler for Acker {
        type Request = PeerMsg<String>;
        type Reply = PeerReply<String>;

        async fn handle(&self, _req: PeerMsg<String>) -> PeerReply<String> {
            PeerReply::Commit { ok: true }
        }
    }

    /// Serves Commits like `Acker`, counting accepted connections.
    async fn counting_server(listener: TcpListener, accepted: Arc<AtomicUsize>) {
        while let Ok((mut conn, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while read_frame::<PeerMsg<String>, _>(&mut conn).await.is_ok() {
                    let reply: PeerReply<String> = PeerReply::Commit { ok: true };
                    if write_frame(&mut conn, &reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_reused() -> Result<(), KikuError> {
        let addr: SocketAddr = "127.0.0.1:21101".parse()?;
        let listener = tcp_bind_with_retry(addr, 0).await?;
        let accepted = Arc::new(AtomicUsize::new(0));
        tokio::spawn(counting_server(listener, accepted.clone()));

        let t = TcpTransport::new(vec!["127.0.0.1:21100".parse()?, addr]);
        for _ in 0..50 {
            assert_eq!(
                PeerTransport::<String>::call(&t, 1, commit_msg()).await?,
                PeerReply::Commit { ok: true }
            );
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(PeerTransport::<String>::call(&t, 2, commit_msg())
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redial_after_restart() -> Result<(), KikuError> {
        let addr: SocketAddr = "127.0.0.1:21111".parse()?;
        let acker = Arc::new(Acker);
        let t = TcpTransport::new(vec!["127.0.0.1:21110".parse()?, addr]);

        let listener = tcp_bind_with_retry(addr, 0).await?;
        let server = RpcServer::spawn("t", listener, Arc::downgrade(&acker));
        assert!(PeerTransport::<String>::call(&t, 1, commit_msg()).await.is_ok());

        // peer goes away; cached connection is closed on its side
        server.stop().await;
        assert!(PeerTransport::<String>::call(&t, 1, commit_msg())
            .await
            .is_err());

        // peer comes back at the same address
        let listener = tcp_bind_with_retry(addr, 2).await?;
        let server = RpcServer::spawn("t", listener, Arc::downgrade(&acker));
        assert!(PeerTransport::<String>::call(&t, 1, commit_msg()).await.is_ok());
        server.stop().await;
        Ok(())
    }
}
