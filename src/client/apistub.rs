//! Kiku client API communication stub implementation.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::{KikuError, read_frame, tcp_connect_with_retry, write_frame};
use crate::server::{ApiReply, ApiRequest, RequestId, RequesterId};

use tokio::net::TcpStream;

/// Client API connection stub, holding one connection to a server.
pub struct ClientApiStub {
    /// My requester ID.
    id: RequesterId,

    /// Next request ID to use.
    next_req: RequestId,

    /// Connection to the server's API address.
    conn: TcpStream,
}

impl ClientApiStub {
    /// Connects to the given server API address.
    pub async fn connect(
        id: RequesterId,
        addr: SocketAddr,
    ) -> Result<Self, KikuError> {
        let conn = tcp_connect_with_retry(addr, 3).await?;
        Ok(ClientApiStub {
            id,
            next_req: fresh_request_id(),
            conn,
        })
    }

    /// Sends a request and waits for its reply.
    pub async fn call(&mut self, req: &ApiRequest) -> Result<ApiReply, KikuError> {
        write_frame(&mut self.conn, req).await?;
        read_frame(&mut self.conn).await
    }

    /// Puts `value` into `key`. Returns whether the server reported success.
    pub async fn put(
        &mut self,
        key: String,
        value: String,
    ) -> Result<bool, KikuError> {
        let req = ApiRequest::Put {
            requester: self.id,
            req_id: self.take_req_id(),
            key,
            value,
        };
        match self.call(&req).await? {
            ApiReply::Put { ok } => Ok(ok),
            ApiReply::Error { msg } => Err(KikuError::msg(msg)),
            reply => Err(KikuError::msg(format!("unexpected reply {:?}", reply))),
        }
    }

    /// Gets the value of `key`, or `None` if not found.
    pub async fn get(&mut self, key: String) -> Result<Option<String>, KikuError> {
        let req = ApiRequest::Get {
            requester: self.id,
            req_id: self.take_req_id(),
            key,
        };
        match self.call(&req).await? {
            ApiReply::Get { value, .. } => Ok(value),
            ApiReply::Error { msg } => Err(KikuError::msg(msg)),
            reply => Err(KikuError::msg(format!("unexpected reply {:?}", reply))),
        }
    }

    /// Queries the server's next free instance ID.
    pub async fn storage_size(&mut self) -> Result<u64, KikuError> {
        match self.call(&ApiRequest::StorageSize).await? {
            ApiReply::StorageSize { size } => Ok(size),
            ApiReply::Error { msg } => Err(KikuError::msg(msg)),
            reply => Err(KikuError::msg(format!("unexpected reply {:?}", reply))),
        }
    }

    fn take_req_id(&mut self) -> RequestId {
        let id = self.next_req;
        self.next_req += 1;
        id
    }
}

/// Generates a request ID from the current time in nanoseconds, so that IDs
/// of a restarted requester keep increasing.
pub fn fresh_request_id() -> RequestId {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as RequestId)
        .unwrap_or(0)
}

#[cfg(test)]
mod apistub_tests {
    use super::*;

    #[test]
    fn request_ids_increase() {
        let a = fresh_request_id();
        let b = fresh_request_id();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_refused() {
        let addr: SocketAddr = "127.0.0.1:21021".parse().unwrap();
        assert!(ClientApiStub::connect(1, addr).await.is_err());
    }
}
