//! Kiku server replicated request type.

use std::fmt;

use crate::server::Command;

use serde::{Deserialize, Serialize};

/// Requester (client agent) ID type.
pub type RequesterId = u64;

/// Client-side request ID type, unique and increasing per requester.
pub type RequestId = u64;

/// Identity of a request used for deduplication.
pub type RequestIdentity = (RequesterId, RequestId);

/// The value replicated through each Paxos instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Issuing requester.
    pub requester: RequesterId,

    /// Requester-local request ID.
    pub req_id: RequestId,

    /// Command to be applied.
    pub cmd: Command,
}

impl Request {
    /// Deduplication identity of this request.
    pub fn identity(&self) -> RequestIdentity {
        (self.requester, self.req_id)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}.{}> {:?}", self.requester, self.req_id, self.cmd)
    }
}
