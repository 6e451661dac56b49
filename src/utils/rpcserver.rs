//! Request/reply serving loop shared by the peer-peer and client-facing
//! endpoints.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Weak;

use crate::utils::{read_frame, write_frame};

use async_trait::async_trait;

use serde::{Serialize, de::DeserializeOwned};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Anything that turns one decoded request into one reply.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    type Request: fmt::Debug + DeserializeOwned + Send;
    type Reply: fmt::Debug + Serialize + Send + Sync;

    /// Handles a single request, producing the reply to send back.
    async fn handle(&self, req: Self::Request) -> Self::Reply;
}

/// TCP acceptor that spawns one servant task per accepted connection. Each
/// servant serves frames sequentially until the connection closes or the
/// server is stopped.
pub struct RpcServer {
    /// Prefix used in log lines.
    me: String,

    /// Sender side of the stop signal.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the acceptor thread, taken upon stopping.
    acceptor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Spawns the acceptor thread over an already-bound listener. The
    /// handler is held weakly so that the server does not keep its owner
    /// alive.
    pub fn spawn<H: RpcHandler>(
        me: impl ToString,
        listener: TcpListener,
        handler: Weak<H>,
    ) -> Self {
        let me = me.to_string();
        let (tx_stop, rx_stop) = watch::channel(false);
        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            me.clone(),
            listener,
            handler,
            rx_stop,
        ));

        RpcServer {
            me,
            tx_stop,
            acceptor_handle: Mutex::new(Some(acceptor_handle)),
        }
    }

    /// Stops accepting new connections, closes all served connections, and
    /// waits until the listener has been released. Idempotent.
    pub async fn stop(&self) {
        let _ = self.tx_stop.send(true);
        if let Some(handle) = self.acceptor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                pf_error!(self.me; "error joining acceptor thread: {}", e);
            }
        }
    }

    /// Acceptor thread function.
    async fn acceptor_thread<H: RpcHandler>(
        me: String,
        listener: TcpListener,
        handler: Weak<H>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!(me; "acceptor thread spawned");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, addr)) => {
                            tokio::spawn(Self::servant_thread(
                                me.clone(),
                                stream,
                                addr,
                                handler.clone(),
                                rx_stop.clone(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(me; "error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_stop.changed() => break,
            }
        }

        // listener gets dropped here, releasing the address
        pf_debug!(me; "acceptor thread exitted");
    }

    /// Servant thread function.
    async fn servant_thread<H: RpcHandler>(
        me: String,
        mut conn: TcpStream,
        addr: SocketAddr,
        handler: Weak<H>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_trace!(me; "servant thread for {} spawned", addr);
        if let Err(e) = conn.set_nodelay(true) {
            pf_warn!(me; "error setting nodelay for {}: {}", addr, e);
        }

        loop {
            let req: H::Request = tokio::select! {
                biased;

                _ = rx_stop.changed() => break,

                req = read_frame(&mut conn) => match req {
                    Ok(req) => req,
                    Err(_) => break, // peer closed connection
                },
            };

            let reply = match handler.upgrade() {
                Some(handler) => handler.handle(req).await,
                None => break, // owner has been dropped
            };

            if let Err(e) = write_frame(&mut conn, &reply).await {
                pf_debug!(me; "error replying to {}: {}", addr, e);
                break;
            }
        }

        pf_trace!(me; "servant thread for {} exitted", addr);
    }
}
